//! Running token/cost totals for a session.

use crate::types::{Pricing, Usage, UsageSummary};

/// Aggregates per-call usage into session totals.
///
/// Cost comes from `usage.cost_usd` when the call reports one; otherwise it
/// is computed from the configured per-1k pricing. The accumulator is
/// restorable verbatim from a snapshot during journal recovery.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    summary: UsageSummary,
    pricing: Pricing,
}

impl UsageAccumulator {
    /// Create an empty accumulator with the given pricing.
    pub fn new(pricing: Pricing) -> Self {
        Self {
            summary: UsageSummary::default(),
            pricing,
        }
    }

    /// Record one call.
    ///
    /// Returns the call's usage with `total_tokens` and `cost_usd`
    /// resolved, which is what lands on the `usage.recorded` journal event.
    pub fn record(&mut self, usage: &Usage) -> Usage {
        let total = usage
            .total_tokens
            .unwrap_or_else(|| usage.input_tokens.saturating_add(usage.output_tokens));
        let cost = usage.cost_usd.unwrap_or_else(|| {
            let input = to_f64(usage.input_tokens) / 1000.0 * self.pricing.input_cost_per_1k;
            let output = to_f64(usage.output_tokens) / 1000.0 * self.pricing.output_cost_per_1k;
            input + output
        });

        self.summary.input_tokens = self.summary.input_tokens.saturating_add(usage.input_tokens);
        self.summary.output_tokens = self
            .summary
            .output_tokens
            .saturating_add(usage.output_tokens);
        self.summary.total_tokens = self.summary.total_tokens.saturating_add(total);
        self.summary.cost_usd += cost;
        self.summary.call_count = self.summary.call_count.saturating_add(1);

        Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: Some(total),
            cost_usd: Some(cost),
        }
    }

    /// Current totals.
    pub fn summary(&self) -> UsageSummary {
        self.summary
    }

    /// Replace internal state verbatim (journal recovery).
    pub fn restore_from(&mut self, summary: UsageSummary) {
        self.summary = summary;
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(v: u64) -> f64 {
    v as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_and_derives_total() {
        let mut acc = UsageAccumulator::new(Pricing::default());
        acc.record(&Usage {
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: None,
            cost_usd: Some(0.25),
        });
        acc.record(&Usage {
            input_tokens: 10,
            output_tokens: 10,
            total_tokens: Some(25),
            cost_usd: Some(0.05),
        });

        let summary = acc.summary();
        assert_eq!(summary.input_tokens, 110);
        assert_eq!(summary.output_tokens, 60);
        assert_eq!(summary.total_tokens, 175);
        assert!((summary.cost_usd - 0.30).abs() < 1e-9);
        assert_eq!(summary.call_count, 2);
    }

    #[test]
    fn test_cost_computed_from_pricing_when_absent() {
        let mut acc = UsageAccumulator::new(Pricing {
            input_cost_per_1k: 0.5,
            output_cost_per_1k: 1.0,
        });
        let resolved = acc.record(&Usage {
            input_tokens: 2000,
            output_tokens: 1000,
            total_tokens: None,
            cost_usd: None,
        });
        assert!((resolved.cost_usd.unwrap_or(0.0) - 2.0).abs() < 1e-9);
        assert_eq!(resolved.total_tokens, Some(3000));
        assert!((acc.summary().cost_usd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_restore_replaces_state_verbatim() {
        let mut acc = UsageAccumulator::new(Pricing::default());
        acc.record(&Usage {
            input_tokens: 5,
            output_tokens: 5,
            total_tokens: None,
            cost_usd: Some(0.01),
        });
        let snapshot = UsageSummary {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            cost_usd: 0.5,
            call_count: 9,
        };
        acc.restore_from(snapshot);
        assert_eq!(acc.summary(), snapshot);
    }
}
