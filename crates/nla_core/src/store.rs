//! SQLite-backed state store for files, requests, quotas, slots and restore disks.
//!
//! One connection per task process; writes that have to maintain stage/flag
//! pairs run inside a single transaction via [`Store::in_transaction`].
//! Timestamps are stored as Unix epoch seconds.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::{
    error::{NlaResult, StoreErrorKind},
    model::{parse_request_files, Quota, RestoreDisk, Slot, Stage, TapeFile, TapeRequest, VERIFY_USER},
};

/// Maximum number of values bound into one SQL `IN (…)` list.
const SQL_IN_BATCH: usize = 900;

/// Size of the reserved `_VERIFY` quota.
const VERIFY_QUOTA_BYTES: u64 = 10_000_000_000_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS restore_disk (
    id INTEGER PRIMARY KEY,
    mountpoint TEXT NOT NULL UNIQUE,
    allocated_bytes INTEGER NOT NULL DEFAULT 0,
    used_bytes INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tape_file (
    id INTEGER PRIMARY KEY,
    logical_path TEXT NOT NULL,
    size INTEGER NOT NULL,
    verified INTEGER,
    stage INTEGER NOT NULL,
    restore_disk_id INTEGER REFERENCES restore_disk(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_tape_file_logical_path ON tape_file(logical_path);
CREATE INDEX IF NOT EXISTS idx_tape_file_stage ON tape_file(stage);
CREATE TABLE IF NOT EXISTS quota (
    id INTEGER PRIMARY KEY,
    user TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    email TEXT,
    notes TEXT
);
CREATE TABLE IF NOT EXISTS tape_request (
    id INTEGER PRIMARY KEY,
    label TEXT,
    quota_id INTEGER NOT NULL REFERENCES quota(id),
    retention INTEGER NOT NULL,
    request_date INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    request_files TEXT NOT NULL DEFAULT '',
    request_patterns TEXT,
    notify_first TEXT,
    notify_last TEXT,
    storaged_start INTEGER,
    storaged_end INTEGER,
    first_on_disk INTEGER,
    last_on_disk INTEGER
);
CREATE INDEX IF NOT EXISTS idx_tape_request_retention ON tape_request(retention);
CREATE TABLE IF NOT EXISTS request_file (
    request_id INTEGER NOT NULL REFERENCES tape_request(id) ON DELETE CASCADE,
    file_id INTEGER NOT NULL REFERENCES tape_file(id) ON DELETE CASCADE,
    UNIQUE (request_id, file_id)
);
CREATE INDEX IF NOT EXISTS idx_request_file_file ON request_file(file_id);
CREATE TABLE IF NOT EXISTS slot (
    id INTEGER PRIMARY KEY,
    tape_request_id INTEGER REFERENCES tape_request(id) ON DELETE SET NULL,
    pid INTEGER,
    host TEXT,
    request_dir TEXT
);
";

/// Fields for a new [`TapeRequest`].
#[derive(Clone, Debug, Default)]
pub struct NewRequest {
    pub label: Option<String>,
    pub quota_id: i64,
    pub retention: Option<DateTime<Utc>>,
    pub request_files: Vec<String>,
    pub request_patterns: Option<String>,
    pub notify_first: Option<String>,
    pub notify_last: Option<String>,
    /// set the storaged/on-disk timestamps on creation (internal requests)
    pub mark_complete_at: Option<DateTime<Utc>>,
}

/// The state store.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>, StoreErrorKind> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(StoreErrorKind::TimestampOutOfRange(secs))
}

fn from_ts_opt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreErrorKind> {
    secs.map(from_ts).transpose()
}

/// Render a stage list as an inline SQL `IN` list of stage codes.
fn stage_list(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

const FILE_COLS: &str = "id, logical_path, size, verified, stage, restore_disk_id";

type RawFile = (i64, String, u64, Option<i64>, i64, Option<i64>);

fn raw_file(row: &Row<'_>) -> rusqlite::Result<RawFile> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_file(raw: RawFile) -> Result<TapeFile, StoreErrorKind> {
    let (id, logical_path, size, verified, stage, restore_disk) = raw;
    Ok(TapeFile {
        id,
        logical_path,
        size,
        verified: from_ts_opt(verified)?,
        stage: Stage::from_code(stage)?,
        restore_disk,
    })
}

const REQUEST_COLS: &str = "id, label, quota_id, retention, request_date, active, request_files, \
     request_patterns, notify_first, notify_last, storaged_start, storaged_end, \
     first_on_disk, last_on_disk";

#[allow(clippy::type_complexity)]
type RawRequest = (
    i64,
    Option<String>,
    i64,
    i64,
    i64,
    bool,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
);

fn raw_request(row: &Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn into_request(raw: RawRequest) -> Result<TapeRequest, StoreErrorKind> {
    let (
        id,
        label,
        quota_id,
        retention,
        request_date,
        active,
        request_files,
        request_patterns,
        notify_first,
        notify_last,
        storaged_start,
        storaged_end,
        first_on_disk,
        last_on_disk,
    ) = raw;
    Ok(TapeRequest {
        id,
        label,
        quota_id,
        retention: from_ts(retention)?,
        request_date: from_ts(request_date)?,
        active,
        request_files: parse_request_files(&request_files),
        request_patterns,
        notify_first,
        notify_last,
        storaged_start: from_ts_opt(storaged_start)?,
        storaged_end: from_ts_opt(storaged_end)?,
        first_on_disk: from_ts_opt(first_on_disk)?,
        last_on_disk: from_ts_opt(last_on_disk)?,
    })
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<Slot> {
    Ok(Slot {
        id: row.get(0)?,
        tape_request: row.get(1)?,
        pid: row.get(2)?,
        host: row.get(3)?,
        request_dir: row.get(4)?,
    })
}

fn disk_from_row(row: &Row<'_>) -> rusqlite::Result<RestoreDisk> {
    Ok(RestoreDisk {
        id: row.get(0)?,
        mountpoint: row.get(1)?,
        allocated_bytes: row.get(2)?,
        used_bytes: row.get(3)?,
    })
}

fn quota_from_row(row: &Row<'_>) -> rusqlite::Result<Quota> {
    Ok(Quota {
        id: row.get(0)?,
        user: row.get(1)?,
        size: row.get(2)?,
        email: row.get(3)?,
        notes: row.get(4)?,
    })
}

impl Store {
    /// Open (and if necessary create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> NlaResult<Self> {
        let conn = Connection::open(path).map_err(StoreErrorKind::FromSqlite)?;
        Self::init(conn)
    }

    /// Open an in-memory store (for tests).
    pub fn open_in_memory() -> NlaResult<Self> {
        let conn = Connection::open_in_memory().map_err(StoreErrorKind::FromSqlite)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> NlaResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreErrorKind::FromSqlite)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreErrorKind::FromSqlite)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreErrorKind::FromSqlite)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StoreErrorKind::FromSqlite)?;
        conn.execute_batch(SCHEMA).map_err(StoreErrorKind::FromSqlite)?;
        Ok(Self { conn })
    }

    /// Run `f` inside a single transaction; rolled back when `f` fails.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> NlaResult<T>) -> NlaResult<T> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(StoreErrorKind::FromSqlite)?;
        let out = f(self)?;
        tx.commit().map_err(StoreErrorKind::FromSqlite)?;
        Ok(out)
    }

    // ─── tape files ─────────────────────────────────────────────────

    /// Register a logical path at stage UNVERIFIED unless it is already present.
    ///
    /// Returns whether a new row was inserted.
    pub fn add_file(&self, logical_path: &str, size: u64) -> NlaResult<bool> {
        if self.file_by_path(logical_path)?.is_some() {
            return Ok(false);
        }
        self.insert_file(logical_path, size, Stage::Unverified)?;
        Ok(true)
    }

    /// Insert a file row at the given stage, without a presence check.
    pub fn insert_file(&self, logical_path: &str, size: u64, stage: Stage) -> NlaResult<i64> {
        self.conn
            .execute(
                "INSERT INTO tape_file (logical_path, size, stage) VALUES (?1, ?2, ?3)",
                params![logical_path, size, stage.code()],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look a file up by its logical path. With duplicate rows present the
    /// lowest id wins; duplicates are repaired by the reconciler.
    pub fn file_by_path(&self, logical_path: &str) -> NlaResult<Option<TapeFile>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM tape_file WHERE logical_path = ?1 ORDER BY id LIMIT 1"),
                params![logical_path],
                raw_file,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)?;
        raw.map(into_file).transpose().map_err(Into::into)
    }

    /// Look a file up by id.
    pub fn file_by_id(&self, id: i64) -> NlaResult<Option<TapeFile>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {FILE_COLS} FROM tape_file WHERE id = ?1"),
                params![id],
                raw_file,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)?;
        raw.map(into_file).transpose().map_err(Into::into)
    }

    /// All rows sharing one logical path, in id order.
    pub fn files_with_path(&self, logical_path: &str) -> NlaResult<Vec<TapeFile>> {
        self.collect_files(
            &format!("SELECT {FILE_COLS} FROM tape_file WHERE logical_path = ?1 ORDER BY id"),
            params![logical_path],
        )
    }

    /// All files in any of the given stages, ordered by logical path.
    pub fn files_in_stages(&self, stages: &[Stage]) -> NlaResult<Vec<TapeFile>> {
        self.collect_files(
            &format!(
                "SELECT {FILE_COLS} FROM tape_file WHERE stage IN ({}) ORDER BY logical_path",
                stage_list(stages)
            ),
            params![],
        )
    }

    /// Files whose logical path contains `pattern`, restricted to the given stages.
    pub fn files_matching(&self, pattern: &str, stages: &[Stage]) -> NlaResult<Vec<TapeFile>> {
        let escaped = pattern.replace('%', "\\%").replace('_', "\\_");
        self.collect_files(
            &format!(
                "SELECT {FILE_COLS} FROM tape_file \
                 WHERE logical_path LIKE ?1 ESCAPE '\\' AND stage IN ({}) ORDER BY logical_path",
                stage_list(stages)
            ),
            params![format!("%{escaped}%")],
        )
    }

    /// Files whose logical path is in `paths`, restricted to the given stages.
    ///
    /// The lookup is chunked so arbitrarily long path lists stay within
    /// SQLite's bound-parameter limit.
    pub fn files_by_paths(&self, paths: &[String], stages: &[Stage]) -> NlaResult<Vec<TapeFile>> {
        let mut files = Vec::new();
        for chunk in paths.chunks(SQL_IN_BATCH) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT {FILE_COLS} FROM tape_file \
                 WHERE logical_path IN ({placeholders}) AND stage IN ({})",
                stage_list(stages)
            );
            let mut stmt = self.conn.prepare(&sql).map_err(StoreErrorKind::FromSqlite)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), raw_file)
                .map_err(StoreErrorKind::FromSqlite)?;
            for row in rows {
                files.push(into_file(row.map_err(StoreErrorKind::FromSqlite)?)?);
            }
        }
        Ok(files)
    }

    fn collect_files(&self, sql: &str, params: impl rusqlite::Params) -> NlaResult<Vec<TapeFile>> {
        let mut stmt = self.conn.prepare(sql).map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt.query_map(params, raw_file).map_err(StoreErrorKind::FromSqlite)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(into_file(row.map_err(StoreErrorKind::FromSqlite)?)?);
        }
        Ok(files)
    }

    /// Set the stage of a file.
    pub fn set_file_stage(&self, id: i64, stage: Stage) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_file SET stage = ?2 WHERE id = ?1",
                params![id, stage.code()],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Set stage and restore disk together (one durable unit).
    pub fn set_file_stage_and_disk(
        &self,
        id: i64,
        stage: Stage,
        restore_disk: Option<i64>,
    ) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_file SET stage = ?2, restore_disk_id = ?3 WHERE id = ?1",
                params![id, stage.code(), restore_disk],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Set or clear the verification timestamp.
    pub fn set_file_verified(&self, id: i64, verified: Option<DateTime<Utc>>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_file SET verified = ?2 WHERE id = ?1",
                params![id, verified.map(to_ts)],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Re-map a mis-registered logical path.
    pub fn set_file_logical_path(&self, id: i64, logical_path: &str) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_file SET logical_path = ?2 WHERE id = ?1",
                params![id, logical_path],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Drop a file row (request mappings go with it).
    pub fn delete_file(&self, id: i64) -> NlaResult<()> {
        self.conn
            .execute("DELETE FROM tape_file WHERE id = ?1", params![id])
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Logical paths that appear on more than one row.
    pub fn duplicate_paths(&self) -> NlaResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT logical_path FROM tape_file GROUP BY logical_path HAVING COUNT(*) > 1")
            .map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StoreErrorKind::FromSqlite)?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row.map_err(StoreErrorKind::FromSqlite)?);
        }
        Ok(paths)
    }

    /// Per-stage file count and total bytes.
    pub fn stage_counts(&self) -> NlaResult<BTreeMap<i64, (u64, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT stage, COUNT(*), COALESCE(SUM(size), 0) FROM tape_file GROUP BY stage")
            .map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, u64>(1)?, row.get::<_, u64>(2)?))
            })
            .map_err(StoreErrorKind::FromSqlite)?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (stage, count, bytes) = row.map_err(StoreErrorKind::FromSqlite)?;
            _ = counts.insert(stage, (count, bytes));
        }
        Ok(counts)
    }

    // ─── restore disks ──────────────────────────────────────────────

    /// Register a restore disk.
    pub fn add_disk(&self, mountpoint: &str, allocated_bytes: u64) -> NlaResult<RestoreDisk> {
        self.conn
            .execute(
                "INSERT INTO restore_disk (mountpoint, allocated_bytes, used_bytes) VALUES (?1, ?2, 0)",
                params![mountpoint, allocated_bytes],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(RestoreDisk {
            id: self.conn.last_insert_rowid(),
            mountpoint: mountpoint.to_string(),
            allocated_bytes,
            used_bytes: 0,
        })
    }

    /// All restore disks in id order.
    pub fn disks(&self) -> NlaResult<Vec<RestoreDisk>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, mountpoint, allocated_bytes, used_bytes FROM restore_disk ORDER BY id")
            .map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt.query_map([], disk_from_row).map_err(StoreErrorKind::FromSqlite)?;
        let mut disks = Vec::new();
        for row in rows {
            disks.push(row.map_err(StoreErrorKind::FromSqlite)?);
        }
        Ok(disks)
    }

    /// Look a restore disk up by id.
    pub fn disk_by_id(&self, id: i64) -> NlaResult<Option<RestoreDisk>> {
        self.conn
            .query_row(
                "SELECT id, mountpoint, allocated_bytes, used_bytes FROM restore_disk WHERE id = ?1",
                params![id],
                disk_from_row,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Overwrite the used-bytes counter of a disk.
    pub fn set_disk_used(&self, id: i64, used_bytes: u64) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE restore_disk SET used_bytes = ?2 WHERE id = ?1",
                params![id, used_bytes],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Total size of RESTORED files on a disk (the authoritative usage).
    pub fn restored_bytes_on_disk(&self, id: i64) -> NlaResult<u64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM tape_file WHERE stage = ?1 AND restore_disk_id = ?2",
                params![Stage::Restored.code(), id],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    // ─── quotas ─────────────────────────────────────────────────────

    /// Register a user quota.
    pub fn add_quota(
        &self,
        user: &str,
        size: u64,
        email: Option<&str>,
        notes: Option<&str>,
    ) -> NlaResult<Quota> {
        self.conn
            .execute(
                "INSERT INTO quota (user, size, email, notes) VALUES (?1, ?2, ?3, ?4)",
                params![user, size, email, notes],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(Quota {
            id: self.conn.last_insert_rowid(),
            user: user.to_string(),
            size,
            email: email.map(str::to_string),
            notes: notes.map(str::to_string),
        })
    }

    /// Look a quota up by user name.
    pub fn quota_by_user(&self, user: &str) -> NlaResult<Option<Quota>> {
        self.conn
            .query_row(
                "SELECT id, user, size, email, notes FROM quota WHERE user = ?1",
                params![user],
                quota_from_row,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Look a quota up by id.
    pub fn quota_by_id(&self, id: i64) -> NlaResult<Option<Quota>> {
        self.conn
            .query_row(
                "SELECT id, user, size, email, notes FROM quota WHERE id = ?1",
                params![id],
                quota_from_row,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Get the reserved `_VERIFY` quota, creating it on first use.
    pub fn ensure_verify_quota(&self) -> NlaResult<Quota> {
        if let Some(quota) = self.quota_by_user(VERIFY_USER)? {
            return Ok(quota);
        }
        self.add_quota(
            VERIFY_USER,
            VERIFY_QUOTA_BYTES,
            None,
            Some("System quota for requests from verification and tidying."),
        )
    }

    /// Bytes of quota consumed by the user's unexpired requests.
    pub fn quota_used(&self, quota_id: i64, now: DateTime<Utc>) -> NlaResult<u64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(f.size), 0) FROM tape_request r \
                 JOIN request_file rf ON rf.request_id = r.id \
                 JOIN tape_file f ON f.id = rf.file_id \
                 WHERE r.quota_id = ?1 AND r.retention >= ?2",
                params![quota_id, to_ts(now)],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    // ─── tape requests ──────────────────────────────────────────────

    /// Create a request. `request_date` is set to `now`.
    pub fn create_request(&self, new: &NewRequest, now: DateTime<Utc>) -> NlaResult<TapeRequest> {
        // default retention is 5 days, as for the public API
        let retention = new.retention.unwrap_or(now + chrono::Duration::days(5));
        let blob = {
            let mut blob = new.request_files.join("\n");
            if !blob.is_empty() {
                blob.push('\n');
            }
            blob
        };
        let complete = new.mark_complete_at.map(to_ts);
        self.conn
            .execute(
                "INSERT INTO tape_request \
                 (label, quota_id, retention, request_date, active, request_files, request_patterns, \
                  notify_first, notify_last, storaged_start, storaged_end, first_on_disk, last_on_disk) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?9, ?9, ?9)",
                params![
                    new.label,
                    new.quota_id,
                    to_ts(retention),
                    to_ts(now),
                    blob,
                    new.request_patterns,
                    new.notify_first,
                    new.notify_last,
                    complete,
                ],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        let id = self.conn.last_insert_rowid();
        Ok(self.request_by_id(id)?.ok_or(StoreErrorKind::NoSuchRequest(id))?)
    }

    /// Look a request up by id.
    pub fn request_by_id(&self, id: i64) -> NlaResult<Option<TapeRequest>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {REQUEST_COLS} FROM tape_request WHERE id = ?1"),
                params![id],
                raw_request,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)?;
        raw.map(into_request).transpose().map_err(Into::into)
    }

    fn collect_requests(&self, sql: &str, params: impl rusqlite::Params) -> NlaResult<Vec<TapeRequest>> {
        let mut stmt = self.conn.prepare(sql).map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt.query_map(params, raw_request).map_err(StoreErrorKind::FromSqlite)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(into_request(row.map_err(StoreErrorKind::FromSqlite)?)?);
        }
        Ok(requests)
    }

    /// All requests, oldest first (first come, first served).
    pub fn requests_by_date(&self) -> NlaResult<Vec<TapeRequest>> {
        self.collect_requests(
            &format!("SELECT {REQUEST_COLS} FROM tape_request ORDER BY request_date, id"),
            params![],
        )
    }

    /// All active requests, oldest first.
    pub fn active_requests(&self) -> NlaResult<Vec<TapeRequest>> {
        self.collect_requests(
            &format!(
                "SELECT {REQUEST_COLS} FROM tape_request WHERE active = 1 ORDER BY request_date, id"
            ),
            params![],
        )
    }

    /// Requests whose retention has lapsed.
    pub fn expired_requests(&self, now: DateTime<Utc>) -> NlaResult<Vec<TapeRequest>> {
        self.collect_requests(
            &format!(
                "SELECT {REQUEST_COLS} FROM tape_request WHERE retention < ?1 ORDER BY request_date, id"
            ),
            params![to_ts(now)],
        )
    }

    /// All requests belonging to a quota.
    pub fn requests_for_quota(&self, quota_id: i64) -> NlaResult<Vec<TapeRequest>> {
        self.collect_requests(
            &format!(
                "SELECT {REQUEST_COLS} FROM tape_request WHERE quota_id = ?1 ORDER BY request_date, id"
            ),
            params![quota_id],
        )
    }

    /// Requests stuck with a storaged start but no end.
    pub fn stuck_requests(&self) -> NlaResult<Vec<TapeRequest>> {
        self.collect_requests(
            &format!(
                "SELECT {REQUEST_COLS} FROM tape_request \
                 WHERE active = 1 AND storaged_start IS NOT NULL AND storaged_end IS NULL \
                 ORDER BY request_date, id"
            ),
            params![],
        )
    }

    /// Flip the active flag.
    pub fn set_request_active(&self, id: i64, active: bool) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_request SET active = ?2 WHERE id = ?1",
                params![id, active],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Update the user-editable request fields. `Some("")` for a notify
    /// address is resolved to the quota email by the caller before this.
    pub fn update_request_fields(
        &self,
        id: i64,
        label: Option<&str>,
        retention: Option<DateTime<Utc>>,
        notify_first: Option<&str>,
        notify_last: Option<&str>,
    ) -> NlaResult<()> {
        if let Some(label) = label {
            self.conn
                .execute("UPDATE tape_request SET label = ?2 WHERE id = ?1", params![id, label])
                .map_err(StoreErrorKind::FromSqlite)?;
        }
        if let Some(retention) = retention {
            self.conn
                .execute(
                    "UPDATE tape_request SET retention = ?2 WHERE id = ?1",
                    params![id, to_ts(retention)],
                )
                .map_err(StoreErrorKind::FromSqlite)?;
        }
        if let Some(first) = notify_first {
            self.conn
                .execute(
                    "UPDATE tape_request SET notify_first = ?2 WHERE id = ?1",
                    params![id, first],
                )
                .map_err(StoreErrorKind::FromSqlite)?;
        }
        if let Some(last) = notify_last {
            self.conn
                .execute(
                    "UPDATE tape_request SET notify_last = ?2 WHERE id = ?1",
                    params![id, last],
                )
                .map_err(StoreErrorKind::FromSqlite)?;
        }
        Ok(())
    }

    /// Replace the requested-paths payload (used by the verifier's synthetic requests).
    pub fn set_request_files_blob(&self, id: i64, paths: &[String]) -> NlaResult<()> {
        let mut blob = paths.join("\n");
        if !blob.is_empty() {
            blob.push('\n');
        }
        self.conn
            .execute(
                "UPDATE tape_request SET request_files = ?2 WHERE id = ?1",
                params![id, blob],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Set or clear the storaged start time.
    pub fn set_storaged_start(&self, id: i64, at: Option<DateTime<Utc>>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_request SET storaged_start = ?2 WHERE id = ?1",
                params![id, at.map(to_ts)],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Set or clear the storaged end time.
    pub fn set_storaged_end(&self, id: i64, at: Option<DateTime<Utc>>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_request SET storaged_end = ?2 WHERE id = ?1",
                params![id, at.map(to_ts)],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Record the first-file-on-disk time, once.
    pub fn set_first_on_disk_if_unset(&self, id: i64, at: DateTime<Utc>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_request SET first_on_disk = ?2 WHERE id = ?1 AND first_on_disk IS NULL",
                params![id, to_ts(at)],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Set or clear the last-file-on-disk time.
    pub fn set_last_on_disk(&self, id: i64, at: Option<DateTime<Utc>>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE tape_request SET last_on_disk = ?2 WHERE id = ?1",
                params![id, at.map(to_ts)],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Add resolved files to a request's growing set.
    pub fn add_files_to_request(&self, request_id: i64, file_ids: &[i64]) -> NlaResult<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR IGNORE INTO request_file (request_id, file_id) VALUES (?1, ?2)")
            .map_err(StoreErrorKind::FromSqlite)?;
        for file_id in file_ids {
            _ = stmt
                .execute(params![request_id, file_id])
                .map_err(StoreErrorKind::FromSqlite)?;
        }
        Ok(())
    }

    /// Reset a request's resolved file set (tidy re-resolves from scratch).
    pub fn clear_request_files(&self, request_id: i64) -> NlaResult<()> {
        self.conn
            .execute("DELETE FROM request_file WHERE request_id = ?1", params![request_id])
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// The resolved files of a request.
    pub fn request_files(&self, request_id: i64) -> NlaResult<Vec<TapeFile>> {
        self.collect_files(
            &format!(
                "SELECT f.{} FROM tape_file f JOIN request_file rf ON rf.file_id = f.id \
                 WHERE rf.request_id = ?1 ORDER BY f.logical_path",
                FILE_COLS.replace(", ", ", f.")
            ),
            params![request_id],
        )
    }

    /// The resolved files of a request restricted to the given stages.
    pub fn request_files_in_stages(
        &self,
        request_id: i64,
        stages: &[Stage],
    ) -> NlaResult<Vec<TapeFile>> {
        self.collect_files(
            &format!(
                "SELECT f.{} FROM tape_file f JOIN request_file rf ON rf.file_id = f.id \
                 WHERE rf.request_id = ?1 AND f.stage IN ({}) ORDER BY f.logical_path",
                FILE_COLS.replace(", ", ", f."),
                stage_list(stages)
            ),
            params![request_id],
        )
    }

    /// Count the resolved files of a request in the given stages.
    pub fn count_request_files_in_stages(
        &self,
        request_id: i64,
        stages: &[Stage],
    ) -> NlaResult<u64> {
        self.conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM tape_file f JOIN request_file rf ON rf.file_id = f.id \
                     WHERE rf.request_id = ?1 AND f.stage IN ({})",
                    stage_list(stages)
                ),
                params![request_id],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Total size of the request's residual tape-resident files.
    pub fn request_residual_bytes(&self, request_id: i64) -> NlaResult<u64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(f.size), 0) FROM tape_file f \
                 JOIN request_file rf ON rf.file_id = f.id \
                 WHERE rf.request_id = ?1 AND f.stage = ?2",
                params![request_id, Stage::OnTape.code()],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Is the file held by any unexpired request other than `exclude`?
    pub fn file_in_live_request(
        &self,
        file_id: i64,
        now: DateTime<Utc>,
        exclude_request: Option<i64>,
    ) -> NlaResult<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM request_file rf \
                 JOIN tape_request r ON r.id = rf.request_id \
                 WHERE rf.file_id = ?1 AND r.retention >= ?2 AND r.id != ?3",
                params![file_id, to_ts(now), exclude_request.unwrap_or(-1)],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(count > 0)
    }

    /// Is the file in the resolved set of any request at all?
    pub fn file_in_any_request(&self, file_id: i64) -> NlaResult<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM request_file WHERE file_id = ?1",
                params![file_id],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(count > 0)
    }

    /// Delete a request (its file mappings cascade).
    pub fn delete_request(&self, id: i64) -> NlaResult<()> {
        self.conn
            .execute("DELETE FROM tape_request WHERE id = ?1", params![id])
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    // ─── slots ──────────────────────────────────────────────────────

    /// All slots in id order.
    pub fn slots(&self) -> NlaResult<Vec<Slot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, tape_request_id, pid, host, request_dir FROM slot ORDER BY id")
            .map_err(StoreErrorKind::FromSqlite)?;
        let rows = stmt.query_map([], slot_from_row).map_err(StoreErrorKind::FromSqlite)?;
        let mut slots = Vec::new();
        for row in rows {
            slots.push(row.map_err(StoreErrorKind::FromSqlite)?);
        }
        Ok(slots)
    }

    /// Look a slot up by id.
    pub fn slot_by_id(&self, id: i64) -> NlaResult<Option<Slot>> {
        self.conn
            .query_row(
                "SELECT id, tape_request_id, pid, host, request_dir FROM slot WHERE id = ?1",
                params![id],
                slot_from_row,
            )
            .optional()
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }

    /// Append an empty slot.
    pub fn create_slot(&self) -> NlaResult<i64> {
        self.conn
            .execute("INSERT INTO slot DEFAULT VALUES", [])
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Delete a slot row.
    pub fn delete_slot(&self, id: i64) -> NlaResult<()> {
        self.conn
            .execute("DELETE FROM slot WHERE id = ?1", params![id])
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Load a request into a slot (or clear it with `None`).
    pub fn set_slot_request(&self, slot_id: i64, request_id: Option<i64>) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE slot SET tape_request_id = ?2 WHERE id = ?1",
                params![slot_id, request_id],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Record the running retrieval process for a slot.
    pub fn set_slot_process(
        &self,
        slot_id: i64,
        pid: u32,
        host: &str,
        request_dir: &str,
    ) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE slot SET pid = ?2, host = ?3, request_dir = ?4 WHERE id = ?1",
                params![slot_id, pid, host, request_dir],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Return a slot to the empty state: no request, no process fields.
    pub fn free_slot(&self, slot_id: i64) -> NlaResult<()> {
        self.conn
            .execute(
                "UPDATE slot SET tape_request_id = NULL, pid = NULL, host = NULL, request_dir = NULL \
                 WHERE id = ?1",
                params![slot_id],
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(())
    }

    /// Is the request already loaded into any slot?
    pub fn request_in_any_slot(&self, request_id: i64) -> NlaResult<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM slot WHERE tape_request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)?;
        Ok(count > 0)
    }

    /// Number of occupied slots whose request belongs to the given user.
    pub fn user_slot_count(&self, user: &str) -> NlaResult<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM slot s \
                 JOIN tape_request r ON r.id = s.tape_request_id \
                 JOIN quota q ON q.id = r.quota_id \
                 WHERE q.user = ?1",
                params![user],
                |row| row.get(0),
            )
            .map_err(StoreErrorKind::FromSqlite)
            .map_err(Into::into)
    }
}
