//! Event history - query and replay of the persisted audit trail

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use super::types::PipelineEvent;
use crate::state::SharedStateStore;

/// Error type for history operations
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Store error: {0}")]
    StoreError(String),
}

/// Result type for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Aggregate statistics over a slice of history
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// Total events in the window
    pub total: usize,
    /// Event counts by type name
    pub by_type: HashMap<String, usize>,
}

/// Query interface over the persisted event trail
pub struct EventHistory {
    store: SharedStateStore,
}

impl EventHistory {
    /// Create a new event history reader
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// Get all events in a time range
    pub fn get_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> HistoryResult<Vec<PipelineEvent>> {
        let start_nanos = start.timestamp_nanos_opt().unwrap_or(0);
        let end_nanos = end.timestamp_nanos_opt().unwrap_or(i64::MAX);

        let events = self
            .store
            .get_events_range::<PipelineEvent>(start_nanos, end_nanos)
            .map_err(|e| HistoryError::StoreError(e.to_string()))?
            .into_iter()
            .map(|(_, event)| event)
            .collect();

        Ok(events)
    }

    /// Get events from the last `minutes` minutes
    pub fn get_recent_events(&self, minutes: i64) -> HistoryResult<Vec<PipelineEvent>> {
        let end = Utc::now();
        let start = end - Duration::minutes(minutes);
        self.get_events(start, end)
    }

    /// Get the full event trail for one claim, oldest first
    pub fn claim_trail(&self, claim_id: &str) -> HistoryResult<Vec<PipelineEvent>> {
        let all = self.get_events(DateTime::<Utc>::MIN_UTC, Utc::now())?;
        Ok(all
            .into_iter()
            .filter(|e| e.claim_id() == Some(claim_id))
            .collect())
    }

    /// Aggregate statistics for a time range
    pub fn stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> HistoryResult<EventStats> {
        let events = self.get_events(start, end)?;
        let mut stats = EventStats {
            total: events.len(),
            by_type: HashMap::new(),
        };
        for event in &events {
            *stats
                .by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::StateStore;
    use tempfile::tempdir;

    fn setup() -> (EventHistory, crate::events::SharedEventBus, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("test.db")).unwrap().shared();
        let bus = EventBus::with_persistence(store.clone()).shared();
        (EventHistory::new(store), bus, dir)
    }

    #[test]
    fn test_claim_trail_filters_by_claim() {
        let (history, bus, _dir) = setup();

        for claim in ["claim-1", "claim-2", "claim-1"] {
            bus.publish(PipelineEvent::LayerPassed {
                claim_id: claim.to_string(),
                layer: 0,
                timestamp: Utc::now(),
            })
            .unwrap();
        }

        let trail = history.claim_trail("claim-1").unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn test_stats_count_by_type() {
        let (history, bus, _dir) = setup();

        bus.publish(PipelineEvent::LayerPassed {
            claim_id: "claim-1".into(),
            layer: 0,
            timestamp: Utc::now(),
        })
        .unwrap();
        bus.publish(PipelineEvent::LayerFlagged {
            claim_id: "claim-1".into(),
            layer: 1,
            round: 0,
            average: 0.5,
            threshold: 0.7,
            timestamp: Utc::now(),
        })
        .unwrap();

        let stats = history
            .stats(Utc::now() - Duration::minutes(5), Utc::now())
            .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type.get("layer_passed"), Some(&1));
        assert_eq!(stats.by_type.get("layer_flagged"), Some(&1));
    }
}
