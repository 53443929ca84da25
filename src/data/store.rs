use std::path::PathBuf;

use chrono::NaiveDate;

use crate::errors::AppError;
use crate::models::instrument::Instrument;
use crate::models::record::PriceRecord;

/// Rows written and skipped by one `insert_records` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkWrite {
    pub inserted: usize,
    pub skipped: usize,
}

/// A chunk stopped partway. `written` holds what was committed (and skipped)
/// before the error; it is empty when the chunk was rolled back.
#[derive(Debug)]
pub struct ChunkRejected {
    pub written: ChunkWrite,
    pub error: AppError,
}

impl ChunkRejected {
    pub fn rolled_back(error: AppError) -> Self {
        Self {
            written: ChunkWrite::default(),
            error,
        }
    }
}

/// Persistent store of price records keyed by (instrument, date).
pub trait RecordStore: Send + Sync {
    /// Insert records. With `atomic`, either every row persists or none does.
    /// With `skip_existing`, rows whose date is already stored are left alone
    /// and counted as skipped; the check and the insert happen as one step.
    fn insert_records(
        &self,
        instrument_id: i64,
        records: &[PriceRecord],
        atomic: bool,
        skip_existing: bool,
    ) -> Result<ChunkWrite, ChunkRejected>;

    /// Delete every record in `[from, to]`. Returns the number of rows removed.
    fn delete_range(
        &self,
        instrument_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize, AppError>;

    fn count_records(&self, instrument_id: i64) -> Result<usize, AppError>;
}

/// Resolves ticker symbols to instruments.
pub trait InstrumentRegistry: Send + Sync {
    fn find(&self, symbol: &str) -> Result<Option<Instrument>, AppError>;

    /// Return the instrument for `symbol`, creating a placeholder if none exists.
    fn resolve_or_create(&self, symbol: &str) -> Result<Instrument, AppError>;
}

/// Produces a point-in-time copy of the store.
pub trait SnapshotProvider: Send + Sync {
    /// Write a snapshot and return its location.
    fn snapshot(&self, label: &str) -> Result<PathBuf, AppError>;
}
