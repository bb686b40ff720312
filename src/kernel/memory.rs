//! Active memory: lesson recall for planning, lesson extraction on
//! session end.
//!
//! The store itself is a collaborator; the kernel only recalls entries for
//! the planner snapshot and appends a one-sentence lesson when a session
//! reaches a terminal state.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLesson {
    /// Short task summary the lesson is keyed by.
    pub task_summary: String,
    /// `completed` or `failed`.
    pub outcome: String,
    /// One-sentence lesson text.
    pub lesson: String,
    /// When the lesson was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Long-term memory consulted by the kernel.
#[async_trait]
pub trait ActiveMemory: Send + Sync {
    /// Recall up to `limit` lesson texts relevant to `query`, newest first.
    async fn recall(&self, query: &str, limit: usize) -> Vec<String>;

    /// Append a lesson.
    async fn append(&self, lesson: MemoryLesson);
}

/// Bounded in-memory store with naive word-overlap recall.
pub struct InMemoryActiveMemory {
    lessons: Mutex<VecDeque<MemoryLesson>>,
    capacity: usize,
}

impl InMemoryActiveMemory {
    /// Create a store keeping at most `capacity` lessons.
    pub fn new(capacity: usize) -> Self {
        Self {
            lessons: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for InMemoryActiveMemory {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ActiveMemory for InMemoryActiveMemory {
    async fn recall(&self, query: &str, limit: usize) -> Vec<String> {
        let lessons = match self.lessons.lock() {
            Ok(l) => l,
            Err(_) => return Vec::new(),
        };
        let query_words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        lessons
            .iter()
            .rev()
            .filter(|l| {
                let haystack = l.task_summary.to_lowercase();
                query_words.iter().any(|w| haystack.contains(w.as_str()))
            })
            .take(limit)
            .map(|l| l.lesson.clone())
            .collect()
    }

    async fn append(&self, lesson: MemoryLesson) {
        if let Ok(mut lessons) = self.lessons.lock() {
            if lessons.len() >= self.capacity {
                lessons.pop_front();
            }
            lessons.push_back(lesson);
        }
    }
}

/// Compose the one-sentence lesson recorded on session end.
pub fn compose_lesson(task_summary: &str, outcome: &str, detail: &str) -> String {
    if detail.is_empty() {
        format!("Task \"{task_summary}\" {outcome}.")
    } else {
        format!("Task \"{task_summary}\" {outcome}: {detail}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(summary: &str, text: &str) -> MemoryLesson {
        MemoryLesson {
            task_summary: summary.to_owned(),
            outcome: "completed".to_owned(),
            lesson: text.to_owned(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recall_matches_on_words() {
        let memory = InMemoryActiveMemory::default();
        memory
            .append(lesson("fetch weather report", "cache the endpoint"))
            .await;
        memory
            .append(lesson("send an email", "confirm recipients first"))
            .await;

        let hits = memory.recall("weather tomorrow", 5).await;
        assert_eq!(hits, vec!["cache the endpoint"]);

        let misses = memory.recall("database migration", 5).await;
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let memory = InMemoryActiveMemory::new(2);
        memory.append(lesson("first task", "one")).await;
        memory.append(lesson("second task", "two")).await;
        memory.append(lesson("third task", "three")).await;

        assert!(memory.recall("first", 5).await.is_empty());
        assert_eq!(memory.recall("third", 5).await, vec!["three"]);
    }

    #[tokio::test]
    async fn test_recall_newest_first() {
        let memory = InMemoryActiveMemory::default();
        memory.append(lesson("deploy service", "older")).await;
        memory.append(lesson("deploy service", "newer")).await;
        let hits = memory.recall("deploy", 5).await;
        assert_eq!(hits, vec!["newer", "older"]);
    }

    #[test]
    fn test_compose_lesson() {
        assert_eq!(
            compose_lesson("fetch data", "failed", "tool timed out"),
            "Task \"fetch data\" failed: tool timed out."
        );
        assert_eq!(
            compose_lesson("fetch data", "completed", ""),
            "Task \"fetch data\" completed."
        );
    }
}
