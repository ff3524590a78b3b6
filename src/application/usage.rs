use crate::types::{TurnUsage, UsageReport};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Append-only consumption counters for one conversation. Recording never
/// affects control flow: a failed record is logged and dropped.
#[derive(Default)]
pub struct UsageLedger {
    inner: Mutex<Ledger>,
}

#[derive(Default)]
struct Ledger {
    per_turn: Vec<TurnUsage>,
    totals: TurnUsage,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, turn: TurnUsage) {
        match self.inner.lock() {
            Ok(mut ledger) => {
                ledger.per_turn.push(turn);
                ledger.totals.add(turn);
                debug!(
                    turn = ledger.per_turn.len(),
                    input_units = turn.input_units,
                    output_units = turn.output_units,
                    discovery_requests = turn.discovery_requests,
                    "Recorded turn usage"
                );
            }
            Err(err) => {
                warn!(%err, "Failed to record usage for turn; counters will undercount");
            }
        }
    }

    /// Read-only snapshot for external reporting.
    pub fn snapshot(&self) -> UsageReport {
        match self.inner.lock() {
            Ok(ledger) => UsageReport {
                per_turn: ledger.per_turn.clone(),
                totals: ledger.totals,
            },
            Err(err) => {
                warn!(%err, "Usage ledger unavailable; returning empty report");
                UsageReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_turn_and_totals() {
        let ledger = UsageLedger::new();
        ledger.record(TurnUsage {
            input_units: 100,
            output_units: 20,
            discovery_requests: 1,
        });
        ledger.record(TurnUsage {
            input_units: 150,
            output_units: 30,
            discovery_requests: 0,
        });

        let report = ledger.snapshot();
        assert_eq!(report.per_turn.len(), 2);
        assert_eq!(report.totals.input_units, 250);
        assert_eq!(report.totals.output_units, 50);
        assert_eq!(report.totals.discovery_requests, 1);
    }

    #[test]
    fn snapshot_of_fresh_ledger_is_empty() {
        let report = UsageLedger::new().snapshot();
        assert!(report.per_turn.is_empty());
        assert_eq!(report.totals, TurnUsage::default());
    }
}
