use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::errors::AppError;
use crate::models::instrument::{Instrument, PLACEHOLDER_EXCHANGE, PLACEHOLDER_SECTOR};
use crate::models::record::PriceRecord;

use super::store::{ChunkRejected, ChunkWrite, InstrumentRegistry, RecordStore, SnapshotProvider};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS instruments (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol      TEXT NOT NULL UNIQUE,
        name        TEXT NOT NULL,
        sector      TEXT NOT NULL,
        exchange    TEXT NOT NULL,
        placeholder INTEGER NOT NULL DEFAULT 0,
        created_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS price_records (
        instrument_id  INTEGER NOT NULL REFERENCES instruments(id),
        date           TEXT NOT NULL,
        open           REAL NOT NULL,
        high           REAL NOT NULL,
        low            REAL NOT NULL,
        close          REAL NOT NULL,
        volume         INTEGER NOT NULL,
        adjusted_close REAL,
        open_interest  INTEGER,
        PRIMARY KEY (instrument_id, date)
    );
";

// ── Schema ──

/// Open (or create) the database file and make sure the schema exists.
pub fn initialize_database(db_path: &str) -> Result<Connection, AppError> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// In-memory database with the schema applied.
pub fn initialize_in_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

// ── Instruments ──

fn instrument_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instrument> {
    Ok(Instrument {
        id: row.get(0)?,
        symbol: row.get(1)?,
        name: row.get(2)?,
        sector: row.get(3)?,
        exchange: row.get(4)?,
        placeholder: row.get::<_, i64>(5)? != 0,
    })
}

pub fn find_instrument(conn: &Connection, symbol: &str) -> Result<Option<Instrument>, AppError> {
    let instrument = conn
        .query_row(
            "SELECT id, symbol, name, sector, exchange, placeholder
             FROM instruments WHERE symbol = ?1",
            params![symbol],
            instrument_from_row,
        )
        .optional()?;
    Ok(instrument)
}

/// Insert a placeholder instrument unless one with this symbol exists already.
pub fn insert_placeholder_instrument(conn: &Connection, symbol: &str) -> Result<(), AppError> {
    let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    conn.execute(
        "INSERT OR IGNORE INTO instruments (symbol, name, sector, exchange, placeholder, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![symbol, symbol, PLACEHOLDER_SECTOR, PLACEHOLDER_EXCHANGE, now],
    )?;
    Ok(())
}

// ── Price records ──

/// Insert rows one statement at a time on the given connection or transaction.
/// `written` keeps the running counts, so a caller still knows how far the
/// loop got when it returns an error.
pub fn insert_price_rows(
    conn: &Connection,
    instrument_id: i64,
    records: &[PriceRecord],
    skip_existing: bool,
    written: &mut ChunkWrite,
) -> Result<(), AppError> {
    let sql = if skip_existing {
        "INSERT OR IGNORE INTO price_records
            (instrument_id, date, open, high, low, close, volume, adjusted_close, open_interest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    } else {
        "INSERT INTO price_records
            (instrument_id, date, open, high, low, close, volume, adjusted_close, open_interest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    };
    let mut stmt = conn.prepare_cached(sql)?;

    for r in records {
        let date = r
            .date
            .ok_or_else(|| AppError::Database("cannot store a record without a date".into()))?;
        let changed = stmt.execute(params![
            instrument_id,
            date.format(DATE_FORMAT).to_string(),
            r.open,
            r.high,
            r.low,
            r.close,
            r.volume,
            r.adjusted_close,
            r.open_interest,
        ])?;
        // OR IGNORE reports zero changes for a date that is already stored
        if changed == 0 {
            written.skipped += 1;
        } else {
            written.inserted += changed;
        }
    }
    Ok(())
}

pub fn delete_price_range(
    conn: &Connection,
    instrument_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<usize, AppError> {
    let removed = conn.execute(
        "DELETE FROM price_records WHERE instrument_id = ?1 AND date BETWEEN ?2 AND ?3",
        params![
            instrument_id,
            from.format(DATE_FORMAT).to_string(),
            to.format(DATE_FORMAT).to_string()
        ],
    )?;
    Ok(removed)
}

pub fn count_price_rows(conn: &Connection, instrument_id: i64) -> Result<usize, AppError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM price_records WHERE instrument_id = ?1",
        params![instrument_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

// ══════════════════════════════════════════════════════════════
// SqliteStore
// ══════════════════════════════════════════════════════════════

/// SQLite-backed record store, instrument registry and snapshot provider.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    backup_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: &Path, backup_dir: PathBuf) -> Result<Self, AppError> {
        let conn = initialize_database(&db_path.to_string_lossy())?;
        info!("Database ready at {}", db_path.display());
        Ok(Self::from_connection(conn, backup_dir))
    }

    pub fn in_memory(backup_dir: PathBuf) -> Result<Self, AppError> {
        Ok(Self::from_connection(initialize_in_memory()?, backup_dir))
    }

    pub fn from_connection(conn: Connection, backup_dir: PathBuf) -> Self {
        Self {
            conn: Mutex::new(conn),
            backup_dir,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AppError> {
        self.conn
            .lock()
            .map_err(|_| AppError::Database("connection lock poisoned".into()))
    }
}

impl RecordStore for SqliteStore {
    fn insert_records(
        &self,
        instrument_id: i64,
        records: &[PriceRecord],
        atomic: bool,
        skip_existing: bool,
    ) -> Result<ChunkWrite, ChunkRejected> {
        let mut conn = self.lock().map_err(ChunkRejected::rolled_back)?;
        let mut written = ChunkWrite::default();

        if !atomic {
            // Rows before the failing one stay committed
            return match insert_price_rows(&conn, instrument_id, records, skip_existing, &mut written) {
                Ok(()) => Ok(written),
                Err(error) => Err(ChunkRejected { written, error }),
            };
        }

        // Dropping the transaction on error rolls the whole chunk back
        let tx = conn
            .transaction()
            .map_err(|e| ChunkRejected::rolled_back(e.into()))?;
        insert_price_rows(&tx, instrument_id, records, skip_existing, &mut written)
            .map_err(ChunkRejected::rolled_back)?;
        tx.commit()
            .map_err(|e| ChunkRejected::rolled_back(e.into()))?;
        Ok(written)
    }

    fn delete_range(
        &self,
        instrument_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize, AppError> {
        let conn = self.lock()?;
        delete_price_range(&conn, instrument_id, from, to)
    }

    fn count_records(&self, instrument_id: i64) -> Result<usize, AppError> {
        let conn = self.lock()?;
        count_price_rows(&conn, instrument_id)
    }
}

impl InstrumentRegistry for SqliteStore {
    fn find(&self, symbol: &str) -> Result<Option<Instrument>, AppError> {
        let conn = self.lock()?;
        find_instrument(&conn, symbol)
    }

    fn resolve_or_create(&self, symbol: &str) -> Result<Instrument, AppError> {
        let conn = self.lock()?;
        if let Some(existing) = find_instrument(&conn, symbol)? {
            return Ok(existing);
        }
        insert_placeholder_instrument(&conn, symbol)?;
        info!("Created placeholder instrument {}", symbol);
        find_instrument(&conn, symbol)?
            .ok_or_else(|| AppError::NotFound(format!("instrument {}", symbol)))
    }
}

impl SnapshotProvider for SqliteStore {
    fn snapshot(&self, label: &str) -> Result<PathBuf, AppError> {
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| AppError::Snapshot(format!("cannot create backup dir: {}", e)))?;

        let safe_label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let file_name = format!(
            "{}-{}.db",
            safe_label,
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let path = self.backup_dir.join(file_name);

        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", params![path.to_string_lossy().to_string()])
            .map_err(|e| AppError::Snapshot(e.to_string()))?;
        info!("Snapshot written to {}", path.display());
        Ok(path)
    }
}
