//! Canonical Price Table
//!
//! The merged, queryable view of per-instrument prices. Seeded once per
//! session from the snapshot endpoint and then kept current by deltas.
//!
//! # Design
//!
//! The table is split into two handles over the same state:
//!
//! - [`PriceTable`]: the only writer. Not `Clone`; mutating methods take
//!   `&mut self`, so there is exactly one writer in the process.
//! - [`PriceTableReader`]: cheap to clone, read-only, handed to consumers.
//!
//! Readers take a short read lock per call and never observe a partially
//! applied record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::market::{InstrumentId, PriceRecord};

// =============================================================================
// Merge Policy
// =============================================================================

/// How a delta is merged against the record already stored for its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Replace unconditionally, in receipt order.
    #[default]
    LastWriteWins,
    /// Drop a delta whose exchange timestamp is older than the stored one.
    RejectStale,
}

impl MergePolicy {
    /// Build the policy from a "reject stale deltas" flag.
    #[must_use]
    pub const fn from_reject_stale(reject_stale: bool) -> Self {
        if reject_stale {
            Self::RejectStale
        } else {
            Self::LastWriteWins
        }
    }
}

/// Result of applying one delta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Identifier was not present before.
    Inserted,
    /// An existing record was replaced.
    Replaced,
    /// Delta was older than the stored record and was dropped.
    RejectedStale,
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug, Default)]
struct TableState {
    records: HashMap<InstrumentId, PriceRecord>,
    initialized: bool,
    last_updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Writer
// =============================================================================

/// Single-writer handle to the canonical price table.
///
/// # Example
///
/// ```rust
/// use market_sync::domain::market::PriceRecord;
/// use market_sync::domain::table::{MergePolicy, PriceTable};
/// use rust_decimal::Decimal;
///
/// let mut table = PriceTable::new(MergePolicy::LastWriteWins);
/// let reader = table.reader();
///
/// table.seed(vec![PriceRecord::new("BTC-KRW", Decimal::from(100))]);
/// table.apply(PriceRecord::new("BTC-KRW", Decimal::from(101)));
///
/// assert!(reader.is_initialized());
/// assert_eq!(reader.get("BTC-KRW").unwrap().price, Decimal::from(101));
/// ```
#[derive(Debug)]
pub struct PriceTable {
    state: Arc<RwLock<TableState>>,
    policy: MergePolicy,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(MergePolicy::default())
    }
}

impl PriceTable {
    /// Create an empty, uninitialized table.
    #[must_use]
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            state: Arc::new(RwLock::new(TableState::default())),
            policy,
        }
    }

    /// Get a read-only handle sharing this table's state.
    #[must_use]
    pub fn reader(&self) -> PriceTableReader {
        PriceTableReader {
            state: Arc::clone(&self.state),
        }
    }

    /// Get the configured merge policy.
    #[must_use]
    pub const fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Seed the table from a snapshot.
    ///
    /// Every identifier present in `records` is overwritten; identifiers not
    /// in the snapshot are left untouched. Marks the table initialized.
    /// Returns the number of records written.
    pub fn seed(&mut self, records: impl IntoIterator<Item = PriceRecord>) -> usize {
        let mut state = self.state.write();
        let mut written = 0;

        for record in records {
            state.records.insert(record.id.clone(), record);
            written += 1;
        }

        state.initialized = true;
        state.last_updated = Some(Utc::now());
        written
    }

    /// Apply one delta record.
    ///
    /// Under [`MergePolicy::LastWriteWins`] the stored record is replaced
    /// without comparing timestamps.
    pub fn apply(&mut self, record: PriceRecord) -> ApplyOutcome {
        let mut state = self.state.write();

        if self.policy == MergePolicy::RejectStale
            && state
                .records
                .get(&record.id)
                .is_some_and(|current| record.is_older_than(current))
        {
            return ApplyOutcome::RejectedStale;
        }

        let outcome = if state.records.insert(record.id.clone(), record).is_some() {
            ApplyOutcome::Replaced
        } else {
            ApplyOutcome::Inserted
        };
        state.last_updated = Some(Utc::now());
        outcome
    }

    /// Remove every record and reset the `initialized` flag.
    pub fn clear(&mut self) {
        let mut state = self.state.write();
        state.records.clear();
        state.initialized = false;
        state.last_updated = None;
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Read-only handle to the canonical price table.
#[derive(Debug, Clone)]
pub struct PriceTableReader {
    state: Arc<RwLock<TableState>>,
}

impl PriceTableReader {
    /// Look up the latest record for an identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PriceRecord> {
        self.state.read().records.get(id).cloned()
    }

    /// Whether a snapshot has been applied since the last full clear.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Time of the last mutation, if any.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_updated
    }

    /// Number of instruments held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Whether the table holds no instruments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Clone out every record currently held.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<InstrumentId, PriceRecord> {
        self.state.read().records.clone()
    }
}
