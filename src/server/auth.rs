//! Bearer authentication with constant-time comparison and key rotation.
//!
//! When a token is configured, every non-health, non-docs route requires
//! `Authorization: Bearer <token>`. Rotation mints a fresh UUID key and
//! keeps each old key valid for a 5-minute grace window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;

/// Grace window during which a rotated-out key stays valid.
pub const ROTATION_GRACE: Duration = Duration::from_secs(300);

/// Rotation failure in insecure (tokenless) mode.
#[derive(Debug, thiserror::Error)]
#[error("key rotation is forbidden in insecure mode")]
pub struct RotationForbidden;

/// Authentication state: the current key plus rotated keys in grace.
#[derive(Debug)]
pub struct AuthState {
    current: Mutex<Option<String>>,
    /// Rotated-out keys with their grace deadline.
    graced: Mutex<HashMap<String, Instant>>,
}

impl AuthState {
    /// Create auth state; `None` means insecure mode.
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            current: Mutex::new(api_token),
            graced: Mutex::new(HashMap::new()),
        }
    }

    /// Whether authentication is enforced at all.
    pub fn enabled(&self) -> bool {
        self.current.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Verify a presented token against the current key and any key still
    /// inside its rotation grace window.
    ///
    /// Equal-length comparisons are constant time; a length mismatch
    /// short-circuits, which leaks only the length.
    pub fn verify(&self, presented: &str) -> bool {
        let current_ok = self
            .current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|key| constant_time_eq(key, presented)))
            .unwrap_or(false);
        if current_ok {
            return true;
        }

        let now = Instant::now();
        let mut graced = match self.graced.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        graced.retain(|_, deadline| *deadline > now);
        graced.keys().any(|key| constant_time_eq(key, presented))
    }

    /// Rotate the key: mint a random UUID key, move the old key into its
    /// grace window, and return the new key.
    ///
    /// # Errors
    ///
    /// [`RotationForbidden`] in insecure mode.
    pub fn rotate(&self) -> Result<String, RotationForbidden> {
        let new_key = uuid::Uuid::new_v4().to_string();
        let mut current = match self.current.lock() {
            Ok(c) => c,
            Err(_) => return Err(RotationForbidden),
        };
        let Some(old_key) = current.replace(new_key.clone()) else {
            *current = None;
            return Err(RotationForbidden);
        };
        drop(current);
        if let Ok(mut graced) = self.graced.lock() {
            let deadline = Instant::now()
                .checked_add(ROTATION_GRACE)
                .unwrap_or_else(Instant::now);
            graced.insert(old_key, deadline);
        }
        Ok(new_key)
    }

    /// Number of keys currently in grace (observability).
    pub fn graced_keys(&self) -> usize {
        self.graced.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// Constant-time equality over equal-length strings; mismatched lengths
/// fail fast.
fn constant_time_eq(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected.ct_eq(presented).into()
}
