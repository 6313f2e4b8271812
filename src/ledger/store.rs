//! Event Store
//!
//! Append-only event streams keyed by `(aggregate_id, sequence)`, with
//! per-aggregate optimistic concurrency: an append naming head N succeeds
//! only if the aggregate's current head is N. No lock spans more than one
//! aggregate's stream.
//!
//! Archival moves events older than a retention threshold to cold storage,
//! but only after a snapshot exists that makes them replay-redundant. The
//! logical replay result never changes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::LedgerError;
use super::event::EventRecord;
use crate::core_types::{AccountId, AssetId, OwnerId, SeqNum};

/// Point-in-time aggregate state at a sequence number.
///
/// Events at or below `sequence` are replay-redundant once this exists,
/// which is the precondition for archiving them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub aggregate_id: AccountId,
    pub sequence: SeqNum,
    pub owner: OwnerId,
    pub frozen: bool,
    pub closed: bool,
    pub opened_at_ms: i64,
    pub balances: BTreeMap<AssetId, u64>,
    pub taken_at_ms: i64,
}

/// Event store contract
///
/// Implementations must guarantee `(aggregate_id, sequence)` uniqueness and
/// reject appends whose expected head does not match the current head.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Compare-and-append: succeeds only if the aggregate's current head
    /// equals `expected_head`. Events must be contiguous starting at
    /// `expected_head + 1`. Returns the new head.
    async fn append(
        &self,
        aggregate_id: AccountId,
        expected_head: SeqNum,
        events: Vec<EventRecord>,
    ) -> Result<SeqNum, LedgerError>;

    /// Load the full logical stream (archived + hot), in sequence order
    async fn load(&self, aggregate_id: AccountId) -> Result<Vec<EventRecord>, LedgerError>;

    /// Load events with `sequence >= from_seq`, in sequence order
    async fn load_from(
        &self,
        aggregate_id: AccountId,
        from_seq: SeqNum,
    ) -> Result<Vec<EventRecord>, LedgerError>;

    /// Current head sequence (0 if the aggregate has no events)
    async fn head(&self, aggregate_id: AccountId) -> Result<SeqNum, LedgerError>;

    /// Persist a snapshot (replaces any previous one for the aggregate)
    async fn save_snapshot(&self, snapshot: BalanceSnapshot) -> Result<(), LedgerError>;

    /// Latest snapshot for the aggregate, if any
    async fn snapshot(
        &self,
        aggregate_id: AccountId,
    ) -> Result<Option<BalanceSnapshot>, LedgerError>;

    /// Move events older than `cutoff_ms` to cold storage. Only events at
    /// or below the snapshot sequence are eligible; fails with
    /// `SnapshotMissing` when no snapshot exists. Returns the number moved.
    async fn archive_before(
        &self,
        aggregate_id: AccountId,
        cutoff_ms: i64,
    ) -> Result<usize, LedgerError>;
}

/// Per-aggregate stream state. One DashMap entry = one consistency
/// boundary; the shard lock makes compare-and-append atomic.
#[derive(Debug, Default)]
struct StreamState {
    hot: Vec<EventRecord>,
    archived: Vec<EventRecord>,
    snapshot: Option<BalanceSnapshot>,
    head: SeqNum,
}

/// In-memory event store for tests and embedded use.
///
/// Same contract as the durable store; coordination is per-aggregate via
/// the map entry, never global.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    streams: DashMap<AccountId, StreamState>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate_id: AccountId,
        expected_head: SeqNum,
        events: Vec<EventRecord>,
    ) -> Result<SeqNum, LedgerError> {
        if events.is_empty() {
            return Err(LedgerError::Storage("empty append".to_string()));
        }

        let mut entry = self.streams.entry(aggregate_id).or_default();

        if entry.head != expected_head {
            return Err(LedgerError::SequenceConflict {
                expected: expected_head,
                found: entry.head,
            });
        }

        // Contiguity check before any mutation
        let mut next = expected_head + 1;
        for event in &events {
            if event.sequence != next || event.aggregate_id != aggregate_id {
                return Err(LedgerError::Storage(format!(
                    "non-contiguous append at sequence {}",
                    event.sequence
                )));
            }
            next += 1;
        }

        entry.head = next - 1;
        entry.hot.extend(events);
        Ok(entry.head)
    }

    async fn load(&self, aggregate_id: AccountId) -> Result<Vec<EventRecord>, LedgerError> {
        match self.streams.get(&aggregate_id) {
            Some(entry) => {
                let mut all =
                    Vec::with_capacity(entry.archived.len() + entry.hot.len());
                all.extend_from_slice(&entry.archived);
                all.extend_from_slice(&entry.hot);
                Ok(all)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn load_from(
        &self,
        aggregate_id: AccountId,
        from_seq: SeqNum,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let all = self.load(aggregate_id).await?;
        Ok(all.into_iter().filter(|e| e.sequence >= from_seq).collect())
    }

    async fn head(&self, aggregate_id: AccountId) -> Result<SeqNum, LedgerError> {
        Ok(self.streams.get(&aggregate_id).map(|e| e.head).unwrap_or(0))
    }

    async fn save_snapshot(&self, snapshot: BalanceSnapshot) -> Result<(), LedgerError> {
        let mut entry = self.streams.entry(snapshot.aggregate_id).or_default();
        if snapshot.sequence > entry.head {
            return Err(LedgerError::Storage(format!(
                "snapshot sequence {} beyond head {}",
                snapshot.sequence, entry.head
            )));
        }
        entry.snapshot = Some(snapshot);
        Ok(())
    }

    async fn snapshot(
        &self,
        aggregate_id: AccountId,
    ) -> Result<Option<BalanceSnapshot>, LedgerError> {
        Ok(self
            .streams
            .get(&aggregate_id)
            .and_then(|e| e.snapshot.clone()))
    }

    async fn archive_before(
        &self,
        aggregate_id: AccountId,
        cutoff_ms: i64,
    ) -> Result<usize, LedgerError> {
        let mut entry = self
            .streams
            .get_mut(&aggregate_id)
            .ok_or_else(|| LedgerError::AccountNotFound(aggregate_id.to_string()))?;

        let snapshot_seq = match &entry.snapshot {
            Some(s) => s.sequence,
            None => return Err(LedgerError::SnapshotMissing),
        };

        let (cold, hot): (Vec<_>, Vec<_>) = entry
            .hot
            .drain(..)
            .partition(|e| e.sequence <= snapshot_seq && e.timestamp_ms < cutoff_ms);

        let moved = cold.len();
        entry.archived.extend(cold);
        entry.hot = hot;

        tracing::info!(
            aggregate_id = %aggregate_id,
            moved,
            "Archived replay-redundant events to cold storage"
        );
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::CorrelationId;
    use crate::ledger::event::LedgerEvent;

    fn record(id: AccountId, seq: SeqNum, amount: u64) -> EventRecord {
        EventRecord::new(
            id,
            seq,
            LedgerEvent::Credited { asset: 1, amount },
            CorrelationId::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();

        let head = store.append(id, 0, vec![record(id, 1, 100)]).await.unwrap();
        assert_eq!(head, 1);

        let head = store
            .append(id, 1, vec![record(id, 2, 50), record(id, 3, 25)])
            .await
            .unwrap();
        assert_eq!(head, 3);

        let events = store.load(id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].sequence, 3);
    }

    #[tokio::test]
    async fn test_stale_append_conflicts() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();

        store.append(id, 0, vec![record(id, 1, 100)]).await.unwrap();

        // A second writer that loaded before the first append
        let err = store
            .append(id, 0, vec![record(id, 1, 42)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::SequenceConflict {
                expected: 0,
                found: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_non_contiguous_append_rejected() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();

        let err = store
            .append(id, 0, vec![record(id, 2, 100)])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[tokio::test]
    async fn test_head_of_unknown_aggregate_is_zero() {
        let store = MemoryEventStore::new();
        assert_eq!(store.head(AccountId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_archive_requires_snapshot() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();
        store.append(id, 0, vec![record(id, 1, 100)]).await.unwrap();

        let err = store.archive_before(id, i64::MAX).await.unwrap_err();
        assert!(matches!(err, LedgerError::SnapshotMissing));
    }

    #[tokio::test]
    async fn test_archive_preserves_logical_stream() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();

        for seq in 1..=4 {
            store
                .append(id, seq - 1, vec![record(id, seq, 10 * seq)])
                .await
                .unwrap();
        }

        store
            .save_snapshot(BalanceSnapshot {
                aggregate_id: id,
                sequence: 2,
                owner: 7,
                frozen: false,
                closed: false,
                opened_at_ms: 0,
                balances: BTreeMap::from([(1, 30)]),
                taken_at_ms: chrono::Utc::now().timestamp_millis(),
            })
            .await
            .unwrap();

        let moved = store.archive_before(id, i64::MAX).await.unwrap();
        assert_eq!(moved, 2);

        // Full logical stream is unchanged
        let events = store.load(id).await.unwrap();
        assert_eq!(events.len(), 4);
        let seqs: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        // Appends continue from the same head
        let head = store.append(id, 4, vec![record(id, 5, 1)]).await.unwrap();
        assert_eq!(head, 5);
    }

    #[tokio::test]
    async fn test_snapshot_beyond_head_rejected() {
        let store = MemoryEventStore::new();
        let id = AccountId::new();
        store.append(id, 0, vec![record(id, 1, 100)]).await.unwrap();

        let err = store
            .save_snapshot(BalanceSnapshot {
                aggregate_id: id,
                sequence: 9,
                owner: 1,
                frozen: false,
                closed: false,
                opened_at_ms: 0,
                balances: BTreeMap::new(),
                taken_at_ms: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }
}
