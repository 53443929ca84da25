use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::errors::AppError;
use crate::models::config::ImportOptions;
use crate::models::instrument::Instrument;
use crate::models::record::PriceRecord;
use crate::models::result::WriteSummary;

use super::store::{ChunkRejected, InstrumentRegistry, RecordStore};

/// A chunk was rejected. Carries everything committed before it.
#[derive(Debug)]
pub struct WriteFailed {
    pub summary: WriteSummary,
    pub error: AppError,
}

/// Commits validated records to the store in fixed-size chunks.
pub struct BatchWriter<'a> {
    store: &'a dyn RecordStore,
    instruments: &'a dyn InstrumentRegistry,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn RecordStore, instruments: &'a dyn InstrumentRegistry) -> Self {
        Self { store, instruments }
    }

    /// Resolve the target instrument, creating a placeholder when unknown.
    pub fn resolve_instrument(&self, symbol: &str) -> Result<Instrument, AppError> {
        let instrument = self.instruments.resolve_or_create(symbol)?;
        if instrument.placeholder {
            debug!("Writing to placeholder instrument {} (id {})", instrument.symbol, instrument.id);
        }
        Ok(instrument)
    }

    /// Write `records` chunk by chunk.
    ///
    /// `cancel` is checked before every chunk; once set, no further chunk is
    /// started and the summary comes back with `cancelled = true`. The first
    /// rejected chunk aborts the remaining ones: its unwritten rows are
    /// counted as failed and the error is returned alongside the committed
    /// counts.
    /// `on_chunk` sees the running summary after each chunk.
    pub fn write<F>(
        &self,
        records: &[PriceRecord],
        instrument: &Instrument,
        options: &ImportOptions,
        cancel: &AtomicBool,
        mut on_chunk: F,
    ) -> Result<WriteSummary, WriteFailed>
    where
        F: FnMut(&WriteSummary),
    {
        let chunk_size = options.effective_batch_size();
        let mut summary = WriteSummary::default();

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!(
                    "Write to {} cancelled before chunk {} ({} rows committed)",
                    instrument.symbol,
                    index + 1,
                    summary.successful
                );
                summary.cancelled = true;
                return Ok(summary);
            }

            match self.store.insert_records(
                instrument.id,
                chunk,
                options.use_transaction,
                options.skip_duplicates,
            ) {
                Ok(written) => {
                    summary.successful += written.inserted;
                    summary.skipped += written.skipped;
                    summary.chunks_written += 1;
                    debug!(
                        "Chunk {} for {}: {} inserted, {} skipped",
                        index + 1,
                        instrument.symbol,
                        written.inserted,
                        written.skipped
                    );
                    on_chunk(&summary);
                }
                Err(ChunkRejected { written, error }) => {
                    warn!("Chunk {} for {} rejected: {}", index + 1, instrument.symbol, error);
                    // Without a transaction, rows before the bad one are already stored
                    let settled = written.inserted + written.skipped;
                    summary.successful += written.inserted;
                    summary.skipped += written.skipped;
                    summary.failed += chunk.len().saturating_sub(settled);
                    on_chunk(&summary);
                    return Err(WriteFailed {
                        summary,
                        error: AppError::WriteFailure {
                            chunk: index + 1,
                            message: error.to_string(),
                        },
                    });
                }
            }
        }

        Ok(summary)
    }
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════
