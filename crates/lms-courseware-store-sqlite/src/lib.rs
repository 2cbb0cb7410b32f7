#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lms_courseware_core::{
    normalize_identifier, now_utc, CandidateSource, CommerceConfiguration,
    CommerceConfigurationInput, HistoryRecord, HistoryStore, ProgressRecord, ProgressRecordInput,
    ProgressStore, Site, SiteConfiguration, StorageError, CORRUPTING_SUFFIX,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, info};

const COURSEWARE_MIGRATION_VERSION: i64 = 1;

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
const DB_TIMESTAMP_FORMAT: &str =
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z";

const SCHEMA_COURSEWARE_V1: &str = r"
CREATE TABLE IF NOT EXISTS courseware_studentmodule (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  module_type TEXT NOT NULL DEFAULT 'problem',
  module_state_key TEXT NOT NULL,
  student_id INTEGER NOT NULL,
  course_id TEXT NOT NULL,
  state TEXT,
  grade REAL,
  max_grade REAL,
  done INTEGER NOT NULL DEFAULT 0 CHECK (done IN (0, 1)),
  created TEXT NOT NULL,
  modified TEXT NOT NULL,
  UNIQUE (student_id, module_state_key, course_id)
);

CREATE INDEX IF NOT EXISTS idx_studentmodule_modified
  ON courseware_studentmodule(modified);
CREATE INDEX IF NOT EXISTS idx_studentmodule_course
  ON courseware_studentmodule(course_id, module_state_key);

CREATE TABLE IF NOT EXISTS courseware_studentmodulehistory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  student_module_id INTEGER NOT NULL,
  version TEXT,
  created TEXT NOT NULL,
  state TEXT,
  grade REAL,
  max_grade REAL,
  FOREIGN KEY (student_module_id) REFERENCES courseware_studentmodule(id)
);

CREATE INDEX IF NOT EXISTS idx_studentmodulehistory_module
  ON courseware_studentmodulehistory(student_module_id, id);

CREATE TABLE IF NOT EXISTS django_site (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  domain TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS site_configuration (
  site_id INTEGER PRIMARY KEY,
  receipt_page TEXT,
  FOREIGN KEY (site_id) REFERENCES django_site(id)
);

CREATE TABLE IF NOT EXISTS commerce_commerceconfiguration (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  change_date TEXT NOT NULL,
  changed_by TEXT,
  enabled INTEGER NOT NULL DEFAULT 0 CHECK (enabled IN (0, 1)),
  checkout_on_ecommerce_service INTEGER NOT NULL DEFAULT 0
    CHECK (checkout_on_ecommerce_service IN (0, 1)),
  single_course_checkout_page TEXT NOT NULL DEFAULT '/basket/single-item/'
    CHECK (length(single_course_checkout_page) <= 255),
  cache_ttl INTEGER NOT NULL DEFAULT 0 CHECK (cache_ttl >= 0),
  site_id INTEGER,
  FOREIGN KEY (site_id) REFERENCES django_site(id)
);

CREATE TRIGGER IF NOT EXISTS trg_commerceconfiguration_no_update
BEFORE UPDATE ON commerce_commerceconfiguration
BEGIN
  SELECT RAISE(FAIL, 'commerce_commerceconfiguration is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_commerceconfiguration_no_delete
BEFORE DELETE ON commerce_commerceconfiguration
BEGIN
  SELECT RAISE(FAIL, 'commerce_commerceconfiguration is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_commerceconfiguration_change
  ON commerce_commerceconfiguration(change_date DESC, id DESC);
";

const PROGRESS_COLUMNS: &str = "id, student_id, course_id, module_state_key, module_type,
     grade, max_grade, state, done, created, modified";

const HISTORY_COLUMNS: &str = "id, student_module_id, version, created, state, grade, max_grade";

const COMMERCE_SELECT: &str = "SELECT
        c.id, c.change_date, c.changed_by, c.enabled, c.checkout_on_ecommerce_service,
        c.single_course_checkout_page, c.cache_ttl,
        s.id, s.domain, s.name, sc.site_id, sc.receipt_page
     FROM commerce_commerceconfiguration c
     LEFT JOIN django_site s ON s.id = c.site_id
     LEFT JOIN site_configuration sc ON sc.site_id = s.id";

pub struct SqliteCoursewareStore {
    conn: Connection,
    read_only: bool,
}

impl SqliteCoursewareStore {
    /// Opens the writable primary database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure_writable(&conn)?;

        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Opens an existing, already-migrated primary for repairs. Unlike
    /// [`Self::open`] this never creates the file or any table.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open existing database at {}", path.display()))?;
        configure_writable(&conn)?;

        let store = Self {
            conn,
            read_only: false,
        };
        store.verify_schema()?;
        Ok(store)
    }

    /// Opens a database for scans only, typically a replica or the primary
    /// during a dry run. Any write through this handle fails at the `SQLite`
    /// layer.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open read-only database at {}", path.display()))?;

        conn.busy_timeout(Duration::from_millis(5000))
            .context("failed to configure read-only busy timeout")?;

        let store = Self {
            conn,
            read_only: true,
        };
        store.verify_schema()?;
        Ok(store)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn migrate(&self) -> Result<()> {
        if self.read_only {
            return Err(anyhow!("cannot migrate a read-only replica"));
        }

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        apply_schema(&self.conn)?;

        let now = format_db_timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COURSEWARE_MIGRATION_VERSION, now],
            )
            .context("failed to register courseware schema migration")?;

        Ok(())
    }

    /// Checks that the tables the reconciler reads exist with the expected
    /// columns. Used on replicas, which are never migrated from here.
    pub fn verify_schema(&self) -> Result<()> {
        ensure_table_has_columns(
            &self.conn,
            "courseware_studentmodule",
            &[
                "id",
                "student_id",
                "course_id",
                "module_state_key",
                "module_type",
                "grade",
                "max_grade",
                "state",
                "done",
                "created",
                "modified",
            ],
        )?;
        ensure_table_has_columns(
            &self.conn,
            "courseware_studentmodulehistory",
            &["id", "student_module_id", "created"],
        )?;
        Ok(())
    }

    /// Inserts a progress row through the normal write path, which stores a
    /// normalized `course_id`.
    pub fn insert_progress_record(&self, input: &ProgressRecordInput) -> Result<ProgressRecord> {
        let normalized = ProgressRecordInput {
            course_id: normalize_identifier(&input.course_id).to_string(),
            ..input.clone()
        };
        let id = insert_progress_row(&self.conn, &normalized)?;
        self.get_progress_record(id)?
            .ok_or_else(|| anyhow!("inserted progress record {id} not readable"))
    }

    pub fn get_progress_record(&self, id: i64) -> Result<Option<ProgressRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {PROGRESS_COLUMNS} FROM courseware_studentmodule WHERE id = ?1"),
                params![id],
                parse_progress_row,
            )
            .optional()
            .with_context(|| format!("failed to load progress record {id}"))
    }

    pub fn list_progress_for_student(&self, student_id: i64) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS}
             FROM courseware_studentmodule
             WHERE student_id = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![student_id], parse_progress_row)?;
        collect_rows(rows)
    }

    pub fn count_progress_records(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM courseware_studentmodule", [], |row| {
                row.get(0)
            })
            .context("failed to count progress records")?;
        usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    /// Rows in `[start, end]` whose `course_id` ends with the corrupting
    /// character, ordered by id.
    pub fn list_malformed(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS}
             FROM courseware_studentmodule
             WHERE modified BETWEEN ?1 AND ?2
               AND substr(course_id, -1) = ?3
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                format_db_timestamp(start)?,
                format_db_timestamp(end)?,
                CORRUPTING_SUFFIX.to_string()
            ],
            parse_progress_row,
        )?;
        let records = collect_rows(rows)?;
        debug!(count = records.len(), "scanned malformed progress rows");
        Ok(records)
    }

    pub fn append_history(
        &self,
        student_module_id: i64,
        version: Option<&str>,
        state: Option<&str>,
        grade: Option<f64>,
        max_grade: Option<f64>,
    ) -> Result<HistoryRecord> {
        let created = now_utc();
        self.conn
            .execute(
                "INSERT INTO courseware_studentmodulehistory(
                    student_module_id, version, created, state, grade, max_grade
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    student_module_id,
                    version,
                    format_db_timestamp(created)?,
                    state,
                    grade,
                    max_grade
                ],
            )
            .with_context(|| {
                format!("failed to append history for progress record {student_module_id}")
            })?;

        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM courseware_studentmodulehistory WHERE id = ?1"),
                params![id],
                parse_history_row,
            )
            .context("failed to read appended history entry")
    }

    pub fn list_history(&self, student_module_id: i64) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS}
             FROM courseware_studentmodulehistory
             WHERE student_module_id = ?1
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![student_module_id], parse_history_row)?;
        collect_rows(rows)
    }

    pub fn count_orphaned_history(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*)
                 FROM courseware_studentmodulehistory h
                 LEFT JOIN courseware_studentmodule m ON m.id = h.student_module_id
                 WHERE m.id IS NULL",
                [],
                |row| row.get(0),
            )
            .context("failed to count orphaned history")?;
        usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    fn find_rows_by_key(
        &self,
        student_id: i64,
        module_state_key: &str,
        course_id: &str,
        exclude_id: i64,
    ) -> Result<Vec<ProgressRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS}
             FROM courseware_studentmodule
             WHERE student_id = ?1 AND module_state_key = ?2 AND course_id = ?3 AND id != ?4
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(
            params![student_id, module_state_key, course_id, exclude_id],
            parse_progress_row,
        )?;
        collect_rows(rows)
    }

    /// Writes every mutable column back; `course_id` is normalized and
    /// `modified` refreshed, as the application does on each save.
    fn update_progress_row(&self, record: &ProgressRecord) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE courseware_studentmodule SET
                    course_id = ?2,
                    module_type = ?3,
                    state = ?4,
                    grade = ?5,
                    max_grade = ?6,
                    done = ?7,
                    modified = ?8
                 WHERE id = ?1",
                params![
                    record.id,
                    normalize_identifier(&record.course_id),
                    record.module_type,
                    record.state,
                    record.grade,
                    record.max_grade,
                    bool_to_sql(record.done),
                    format_db_timestamp(now_utc())?
                ],
            )
            .with_context(|| format!("failed to save progress record {}", record.id))?;

        if changed == 0 {
            return Err(anyhow!("progress record {} does not exist", record.id));
        }
        Ok(())
    }

    fn delete_progress_row(&self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM courseware_studentmodule WHERE id = ?1",
                params![id],
            )
            .with_context(|| format!("failed to delete progress record {id}"))?;

        if changed == 0 {
            return Err(anyhow!("progress record {id} does not exist"));
        }
        Ok(())
    }

    fn delete_history_row(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM courseware_studentmodulehistory WHERE id = ?1",
                params![id],
            )
            .with_context(|| format!("failed to delete history entry {id}"))?;
        Ok(())
    }

    pub fn upsert_site(&self, domain: &str, name: &str, receipt_page: Option<&str>) -> Result<Site> {
        if domain.trim().is_empty() {
            return Err(anyhow!("site domain MUST be provided"));
        }

        self.conn
            .execute(
                "INSERT INTO django_site(domain, name) VALUES (?1, ?2)
                 ON CONFLICT(domain) DO UPDATE SET name = excluded.name",
                params![domain, name],
            )
            .with_context(|| format!("failed to upsert site {domain}"))?;

        let site_id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM django_site WHERE domain = ?1",
                params![domain],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to resolve site {domain}"))?;

        match receipt_page {
            Some(page) => {
                self.conn
                    .execute(
                        "INSERT INTO site_configuration(site_id, receipt_page) VALUES (?1, ?2)
                         ON CONFLICT(site_id) DO UPDATE SET receipt_page = excluded.receipt_page",
                        params![site_id, page],
                    )
                    .context("failed to upsert site configuration")?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM site_configuration WHERE site_id = ?1",
                        params![site_id],
                    )
                    .context("failed to clear site configuration")?;
            }
        }

        self.get_site(site_id)?
            .ok_or_else(|| anyhow!("site {site_id} not readable after upsert"))
    }

    pub fn get_site(&self, site_id: i64) -> Result<Option<Site>> {
        self.conn
            .query_row(
                "SELECT s.id, s.domain, s.name, sc.site_id, sc.receipt_page
                 FROM django_site s
                 LEFT JOIN site_configuration sc ON sc.site_id = s.id
                 WHERE s.id = ?1",
                params![site_id],
                |row| {
                    let configured: Option<i64> = row.get(3)?;
                    let receipt_page: Option<String> = row.get(4)?;
                    Ok(Site {
                        id: row.get(0)?,
                        domain: row.get(1)?,
                        name: row.get(2)?,
                        configuration: configured.map(|_| SiteConfiguration { receipt_page }),
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load site {site_id}"))
    }

    /// The newest configuration row, or defaults (disabled) when none exists.
    pub fn current_commerce_configuration(&self) -> Result<CommerceConfiguration> {
        let current = self
            .conn
            .query_row(
                &format!("{COMMERCE_SELECT} ORDER BY c.change_date DESC, c.id DESC LIMIT 1"),
                [],
                parse_commerce_row,
            )
            .optional()
            .context("failed to load current commerce configuration")?;

        Ok(current.unwrap_or_default())
    }

    pub fn commerce_configuration_history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<CommerceConfiguration>> {
        let mut query = format!("{COMMERCE_SELECT} ORDER BY c.change_date DESC, c.id DESC");
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_commerce_row)?;
        collect_rows(rows)
    }

    /// Records a new configuration version; earlier versions are kept.
    pub fn save_commerce_configuration(
        &self,
        input: &CommerceConfigurationInput,
    ) -> Result<CommerceConfiguration> {
        input
            .validate()
            .map_err(|err| anyhow!("invalid commerce configuration: {err}"))?;

        if let Some(site_id) = input.site_id {
            if self.get_site(site_id)?.is_none() {
                return Err(anyhow!("unknown site_id {site_id}"));
            }
        }

        self.conn
            .execute(
                "INSERT INTO commerce_commerceconfiguration(
                    change_date, changed_by, enabled, checkout_on_ecommerce_service,
                    single_course_checkout_page, cache_ttl, site_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    format_db_timestamp(now_utc())?,
                    input.changed_by,
                    bool_to_sql(input.enabled),
                    bool_to_sql(input.checkout_on_ecommerce_service),
                    input.single_course_checkout_page,
                    i64::from(input.cache_ttl),
                    input.site_id
                ],
            )
            .context("failed to record commerce configuration")?;

        let id = self.conn.last_insert_rowid();
        info!(config_id = id, enabled = input.enabled, "recorded commerce configuration");

        self.conn
            .query_row(
                &format!("{COMMERCE_SELECT} WHERE c.id = ?1"),
                params![id],
                parse_commerce_row,
            )
            .context("failed to read recorded commerce configuration")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CandidateSource for SqliteCoursewareStore {
    fn query_candidates(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        self.list_malformed(start, end).map_err(storage_error)
    }
}

impl ProgressStore for SqliteCoursewareStore {
    fn get_by_id(&self, id: i64) -> Result<Option<ProgressRecord>, StorageError> {
        self.get_progress_record(id).map_err(storage_error)
    }

    fn find_conflicts(
        &self,
        student_id: i64,
        module_state_key: &str,
        course_id: &str,
        exclude_id: i64,
    ) -> Result<Vec<ProgressRecord>, StorageError> {
        self.find_rows_by_key(student_id, module_state_key, course_id, exclude_id)
            .map_err(storage_error)
    }

    fn save(&self, record: &ProgressRecord) -> Result<(), StorageError> {
        self.update_progress_row(record).map_err(storage_error)
    }

    fn delete(&self, record: &ProgressRecord) -> Result<(), StorageError> {
        self.delete_progress_row(record.id).map_err(storage_error)
    }
}

impl HistoryStore for SqliteCoursewareStore {
    fn history_for(&self, records: &[ProgressRecord]) -> Result<Vec<HistoryRecord>, StorageError> {
        let mut entries = Vec::new();
        for record in records {
            entries.extend(self.list_history(record.id).map_err(storage_error)?);
        }
        Ok(entries)
    }

    fn delete_history(&self, entry: &HistoryRecord) -> Result<(), StorageError> {
        self.delete_history_row(entry.id).map_err(storage_error)
    }
}

fn configure_writable(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")
}

/// Creates the courseware tables if missing.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_COURSEWARE_V1)
        .context("failed to apply courseware schema")
}

/// Inserts a progress row exactly as given, including a corrupted
/// `course_id`. This reproduces the legacy write path and exists for
/// fixtures and tests; application code goes through
/// [`SqliteCoursewareStore::insert_progress_record`].
pub fn seed_raw_progress_record(conn: &Connection, input: &ProgressRecordInput) -> Result<i64> {
    apply_schema(conn)?;
    insert_progress_row(conn, input)
}

fn insert_progress_row(conn: &Connection, input: &ProgressRecordInput) -> Result<i64> {
    let now = now_utc();
    let modified = input.modified.unwrap_or(now);
    conn.execute(
        "INSERT INTO courseware_studentmodule(
            module_type, module_state_key, student_id, course_id,
            state, grade, max_grade, done, created, modified
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.module_type,
            input.module_state_key,
            input.student_id,
            input.course_id,
            input.state,
            input.grade,
            input.max_grade,
            bool_to_sql(input.done),
            format_db_timestamp(now.min(modified))?,
            format_db_timestamp(modified)?
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert progress record for student {} / {}",
            input.student_id, input.module_state_key
        )
    })?;

    Ok(conn.last_insert_rowid())
}

pub fn format_db_timestamp(value: OffsetDateTime) -> Result<String> {
    let format = time::format_description::parse(DB_TIMESTAMP_FORMAT)
        .context("invalid timestamp format description")?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .context("failed to format timestamp")
}

pub fn parse_db_timestamp(raw: &str) -> Result<OffsetDateTime> {
    let format = time::format_description::parse(DB_TIMESTAMP_FORMAT)
        .context("invalid timestamp format description")?;
    PrimitiveDateTime::parse(raw, &format)
        .map(PrimitiveDateTime::assume_utc)
        .with_context(|| format!("invalid stored timestamp: {raw}"))
}

fn parse_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRecord> {
    let done: i64 = row.get(8)?;
    let created_raw: String = row.get(9)?;
    let modified_raw: String = row.get(10)?;

    Ok(ProgressRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        course_id: row.get(2)?,
        module_state_key: row.get(3)?,
        module_type: row.get(4)?,
        grade: row.get(5)?,
        max_grade: row.get(6)?,
        state: row.get(7)?,
        done: done != 0,
        created: timestamp_column(9, &created_raw)?,
        modified: timestamp_column(10, &modified_raw)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let created_raw: String = row.get(3)?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        student_module_id: row.get(1)?,
        version: row.get(2)?,
        created: timestamp_column(3, &created_raw)?,
        state: row.get(4)?,
        grade: row.get(5)?,
        max_grade: row.get(6)?,
    })
}

fn parse_commerce_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommerceConfiguration> {
    let change_date_raw: String = row.get(1)?;
    let enabled: i64 = row.get(3)?;
    let checkout_on_ecommerce_service: i64 = row.get(4)?;
    let cache_ttl_i64: i64 = row.get(6)?;
    let site_id: Option<i64> = row.get(7)?;
    let configured_site: Option<i64> = row.get(10)?;

    let cache_ttl = u32::try_from(cache_ttl_i64).map_err(|_| {
        invalid_column(
            6,
            rusqlite::types::Type::Integer,
            format!("invalid cache_ttl: {cache_ttl_i64}"),
        )
    })?;

    let site = match site_id {
        Some(id) => Some(Site {
            id,
            domain: row.get(8)?,
            name: row.get(9)?,
            configuration: match configured_site {
                Some(_) => Some(SiteConfiguration {
                    receipt_page: row.get(11)?,
                }),
                None => None,
            },
        }),
        None => None,
    };

    Ok(CommerceConfiguration {
        id: Some(row.get(0)?),
        change_date: Some(timestamp_column(1, &change_date_raw)?),
        changed_by: row.get(2)?,
        enabled: enabled != 0,
        checkout_on_ecommerce_service: checkout_on_ecommerce_service != 0,
        single_course_checkout_page: row.get(5)?,
        cache_ttl,
        site,
    })
}

fn timestamp_column(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_db_timestamp(raw)
        .map_err(|err| invalid_column(index, rusqlite::types::Type::Text, format!("{err:#}")))
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    if !table_exists(conn, table_name)? {
        return Err(anyhow!(
            "courseware schema check failed: expected table {table_name}"
        ));
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "courseware schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[allow(clippy::needless_pass_by_value)]
fn storage_error(err: anyhow::Error) -> StorageError {
    StorageError::new(format!("{err:#}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use lms_courseware_core::{parse_rfc3339_utc, FixResult, Reconciler, RunReport};
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use ulid::Ulid;

    const COURSE: &str = "course-v1:edX+DemoX+Demo_Course";
    const PROBLEM_KEY: &str = "block-v1:edX+DemoX+Demo_Course+type@problem+block@q1";

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_store() -> SqliteCoursewareStore {
        let store = must(SqliteCoursewareStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("courseware-{label}-{}.sqlite3", Ulid::new()))
    }

    fn fixture_input(
        student_id: i64,
        course_id: &str,
        grade: Option<f64>,
        modified: &str,
    ) -> ProgressRecordInput {
        ProgressRecordInput {
            student_id,
            course_id: course_id.to_string(),
            module_state_key: PROBLEM_KEY.to_string(),
            module_type: "problem".to_string(),
            grade,
            max_grade: Some(1.0),
            state: Some(format!("{{\"grade\": {}}}", grade.unwrap_or_default())),
            done: false,
            modified: Some(must_utc(modified)),
        }
    }

    fn seed_raw(store: &SqliteCoursewareStore, input: &ProgressRecordInput) -> i64 {
        must(seed_raw_progress_record(store.connection(), input))
    }

    fn run_window(store: &SqliteCoursewareStore, dry_run: bool) -> RunReport {
        let reconciler = Reconciler::new(store, store);
        match reconciler.run(
            must_utc("2016-08-23T00:00:00Z"),
            must_utc("2016-08-24T22:00:00Z"),
            dry_run,
        ) {
            Ok(report) => report,
            Err(err) => panic!("reconcile run failed: {err}"),
        }
    }

    fn newline_course() -> String {
        format!("{COURSE}\n")
    }

    #[test]
    fn timestamps_round_trip_with_fixed_width() {
        let value = must_utc("2016-08-23T16:43:00.5Z");
        let formatted = must(format_db_timestamp(value));
        assert_eq!(formatted, "2016-08-23T16:43:00.500000Z");
        assert_eq!(must(parse_db_timestamp(&formatted)), value);

        let whole = must(format_db_timestamp(must_utc("2016-08-23T16:43:00Z")));
        assert!(whole < formatted);
    }

    #[test]
    fn normal_write_path_strips_trailing_newline() {
        let store = fixture_store();
        let record = must(store.insert_progress_record(&fixture_input(
            1,
            &newline_course(),
            Some(0.5),
            "2016-08-23T12:00:00Z",
        )));
        assert_eq!(record.course_id, COURSE);
        assert!(!record.is_malformed());
    }

    #[test]
    fn scan_matches_only_malformed_rows_inside_window() {
        let store = fixture_store();
        let inside = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), None, "2016-08-23T12:00:00Z"),
        );
        seed_raw(
            &store,
            &fixture_input(2, &newline_course(), None, "2016-08-25T12:00:00Z"),
        );
        seed_raw(&store, &fixture_input(3, COURSE, None, "2016-08-23T12:00:00Z"));
        let on_bound = seed_raw(
            &store,
            &fixture_input(4, &newline_course(), None, "2016-08-24T22:00:00Z"),
        );

        let found = must(store.list_malformed(
            must_utc("2016-08-23T00:00:00Z"),
            must_utc("2016-08-24T22:00:00Z"),
        ));
        let ids: Vec<i64> = found.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![inside, on_bound]);
        assert!(found.iter().all(ProgressRecord::is_malformed));
    }

    #[test]
    fn no_conflict_row_is_trimmed_in_place() {
        let store = fixture_store();
        let id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.3), "2016-08-23T12:00:00Z"),
        );

        let report = run_window(&store, false);
        assert_eq!(report.rows_detected, 1);
        assert_eq!(report.totals, FixResult::trimmed());

        let row = match must(store.get_progress_record(id)) {
            Some(value) => value,
            None => panic!("trimmed row missing"),
        };
        assert_eq!(row.course_id, COURSE);
        assert_eq!(row.grade, Some(0.3));
    }

    #[test]
    fn malformed_winner_is_merged_and_history_removed() {
        let store = fixture_store();
        let correct_id = seed_raw(
            &store,
            &fixture_input(1, COURSE, Some(0.5), "2016-08-23T12:00:00Z"),
        );
        let malformed_id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.9), "2016-08-23T11:00:00Z"),
        );
        must(store.append_history(malformed_id, Some("v1"), Some("{}"), Some(0.2), Some(1.0)));
        must(store.append_history(malformed_id, Some("v1"), Some("{}"), Some(0.9), Some(1.0)));
        must(store.append_history(correct_id, Some("v1"), Some("{}"), Some(0.5), Some(1.0)));

        let report = run_window(&store, false);
        assert_eq!(report.totals, FixResult::copied_and_deleted());

        let correct = match must(store.get_progress_record(correct_id)) {
            Some(value) => value,
            None => panic!("correct row missing"),
        };
        assert_eq!(correct.grade, Some(0.9));
        assert_eq!(correct.course_id, COURSE);
        assert_eq!(correct.state, Some("{\"grade\": 0.9}".to_string()));
        assert!(must(store.get_progress_record(malformed_id)).is_none());
        assert!(must(store.list_history(malformed_id)).is_empty());
        assert_eq!(must(store.list_history(correct_id)).len(), 1);
        assert_eq!(must(store.count_orphaned_history()), 0);
        assert_eq!(must(store.count_progress_records()), 1);
    }

    #[test]
    fn grade_tie_with_newer_malformed_row_copies_data() {
        let store = fixture_store();
        let correct_id = seed_raw(
            &store,
            &fixture_input(1, COURSE, Some(0.5), "2016-08-23T12:00:00Z"),
        );
        let mut newer = fixture_input(1, &newline_course(), Some(0.5), "2016-08-24T09:00:00Z");
        newer.done = true;
        let malformed_id = seed_raw(&store, &newer);

        let report = run_window(&store, false);
        assert_eq!(report.totals, FixResult::copied_and_deleted());
        let correct = match must(store.get_progress_record(correct_id)) {
            Some(value) => value,
            None => panic!("correct row missing"),
        };
        assert!(correct.done);
        assert!(must(store.get_progress_record(malformed_id)).is_none());
    }

    #[test]
    fn correct_winner_keeps_its_data() {
        let store = fixture_store();
        let correct_id = seed_raw(
            &store,
            &fixture_input(1, COURSE, Some(0.9), "2016-08-23T12:00:00Z"),
        );
        let malformed_id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.5), "2016-08-24T12:00:00Z"),
        );
        must(store.append_history(malformed_id, None, None, Some(0.5), Some(1.0)));
        let before = must(store.get_progress_record(correct_id));

        let report = run_window(&store, false);
        assert_eq!(report.totals, FixResult::deleted());
        assert_eq!(must(store.get_progress_record(correct_id)), before);
        assert!(must(store.get_progress_record(malformed_id)).is_none());
        assert_eq!(must(store.count_orphaned_history()), 0);
    }

    #[test]
    fn dry_run_leaves_database_untouched() {
        let store = fixture_store();
        seed_raw(&store, &fixture_input(1, COURSE, Some(0.5), "2016-08-23T12:00:00Z"));
        let merged = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.9), "2016-08-23T12:00:00Z"),
        );
        must(store.append_history(merged, None, None, None, None));
        seed_raw(
            &store,
            &fixture_input(2, &newline_course(), None, "2016-08-23T12:00:00Z"),
        );

        let before_one = must(store.list_progress_for_student(1));
        let before_two = must(store.list_progress_for_student(2));
        assert_eq!(must(store.count_progress_records()), 3);

        let report = run_window(&store, true);
        assert_eq!(report.rows_detected, 2);
        assert_eq!(
            report.totals,
            FixResult {
                record_trimmed: 1,
                data_copied: 1,
                record_deleted: 1,
                error: 0,
            }
        );
        assert_eq!(must(store.list_progress_for_student(1)), before_one);
        assert_eq!(must(store.list_progress_for_student(2)), before_two);
        assert_eq!(must(store.list_history(merged)).len(), 1);
        assert_eq!(must(store.count_progress_records()), 3);
    }

    #[test]
    fn row_deleted_after_scan_is_counted_as_error() {
        let store = fixture_store();
        let id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.1), "2016-08-23T12:00:00Z"),
        );
        let candidates = must(store.list_malformed(
            must_utc("2016-08-23T00:00:00Z"),
            must_utc("2016-08-24T00:00:00Z"),
        ));
        must(store.delete_progress_row(id));

        let reconciler = Reconciler::new(&store, &store);
        let totals: FixResult = candidates
            .iter()
            .map(|candidate| reconciler.fix_record(candidate, false))
            .sum();
        assert_eq!(totals, FixResult::error());
    }

    #[test]
    fn deleting_row_with_history_is_refused_by_foreign_key() {
        let store = fixture_store();
        let id = seed_raw(
            &store,
            &fixture_input(1, COURSE, Some(0.1), "2016-08-23T12:00:00Z"),
        );
        must(store.append_history(id, None, None, None, None));
        assert!(store.delete_progress_row(id).is_err());
    }

    #[test]
    fn saving_trimmed_row_over_existing_key_violates_uniqueness() {
        let store = fixture_store();
        seed_raw(&store, &fixture_input(1, COURSE, Some(0.1), "2016-08-23T12:00:00Z"));
        let malformed_id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.1), "2016-08-23T12:00:00Z"),
        );
        let malformed = match must(store.get_progress_record(malformed_id)) {
            Some(value) => value,
            None => panic!("malformed row missing"),
        };

        assert!(ProgressStore::save(&store, &malformed).is_err());
    }

    #[test]
    fn second_run_makes_no_changes() {
        let store = fixture_store();
        seed_raw(&store, &fixture_input(1, COURSE, Some(0.5), "2016-08-23T12:00:00Z"));
        seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.9), "2016-08-23T12:00:00Z"),
        );
        seed_raw(
            &store,
            &fixture_input(2, &newline_course(), Some(0.4), "2016-08-23T12:00:00Z"),
        );

        let first = run_window(&store, false);
        assert_eq!(first.rows_detected, 2);
        let snapshot = (
            must(store.list_progress_for_student(1)),
            must(store.list_progress_for_student(2)),
        );

        let second = run_window(&store, false);
        assert_eq!(second.rows_detected, 0);
        assert_eq!(second.totals, FixResult::default());
        assert_eq!(
            (
                must(store.list_progress_for_student(1)),
                must(store.list_progress_for_student(2)),
            ),
            snapshot
        );
    }

    #[test]
    fn rerun_after_interrupted_merge_deletes_leftover_row() {
        let store = fixture_store();
        let correct_id = seed_raw(
            &store,
            &fixture_input(1, COURSE, Some(0.5), "2016-08-23T12:00:00Z"),
        );
        let malformed_id = seed_raw(
            &store,
            &fixture_input(1, &newline_course(), Some(0.9), "2016-08-23T12:00:00Z"),
        );

        // Simulate a crash between saving the merged row and deleting the
        // malformed one.
        let malformed = match must(store.get_progress_record(malformed_id)) {
            Some(value) => value,
            None => panic!("malformed row missing"),
        };
        let mut correct = match must(store.get_progress_record(correct_id)) {
            Some(value) => value,
            None => panic!("correct row missing"),
        };
        correct.copy_progress_from(&malformed);
        must(store.update_progress_row(&correct));

        let report = run_window(&store, false);
        assert_eq!(report.totals, FixResult::deleted());
        assert!(must(store.get_progress_record(malformed_id)).is_none());
        let merged = match must(store.get_progress_record(correct_id)) {
            Some(value) => value,
            None => panic!("correct row missing"),
        };
        assert_eq!(merged.grade, Some(0.9));
    }

    #[test]
    fn replica_handle_scans_but_primary_receives_writes() {
        let path = temp_db_path("replica");
        let primary = must(SqliteCoursewareStore::open(&path));
        must(primary.migrate());
        let id = must(seed_raw_progress_record(
            &primary.conn,
            &fixture_input(1, &newline_course(), Some(0.7), "2016-08-23T12:00:00Z"),
        ));

        let replica = must(SqliteCoursewareStore::open_read_only(&path));
        assert!(replica.is_read_only());
        assert!(replica.migrate().is_err());

        let reconciler = Reconciler::new(&replica, &primary);
        let report = match reconciler.run(
            must_utc("2016-08-23T00:00:00Z"),
            must_utc("2016-08-24T00:00:00Z"),
            false,
        ) {
            Ok(value) => value,
            Err(err) => panic!("reconcile failed: {err}"),
        };
        assert_eq!(report.totals, FixResult::trimmed());
        assert_eq!(
            must(primary.get_progress_record(id)).map(|row| row.course_id),
            Some(COURSE.to_string())
        );

        drop(replica);
        drop(primary);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_existing_never_creates_a_database() {
        let path = temp_db_path("missing-primary");
        assert!(SqliteCoursewareStore::open_existing(&path).is_err());
        assert!(SqliteCoursewareStore::open_read_only(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn open_existing_requires_courseware_schema() {
        let path = temp_db_path("unmigrated-primary");
        {
            let conn = match Connection::open(&path) {
                Ok(value) => value,
                Err(err) => panic!("failed to create empty db: {err}"),
            };
            if let Err(err) = conn.execute_batch("CREATE TABLE unrelated (id INTEGER);") {
                panic!("failed to create table: {err}");
            }
        }

        let err = match SqliteCoursewareStore::open_existing(&path) {
            Ok(_) => panic!("expected schema check failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("courseware_studentmodule"));
        let conn = must(Connection::open(&path).map_err(anyhow::Error::from));
        assert!(!must(table_exists(&conn, "schema_migrations")));
        drop(conn);
        let _ = std::fs::remove_file(&path);

        let migrated = temp_db_path("migrated-primary");
        must(must(SqliteCoursewareStore::open(&migrated)).migrate());
        let store = must(SqliteCoursewareStore::open_existing(&migrated));
        assert!(!store.is_read_only());
        assert_eq!(must(store.count_progress_records()), 0);
        drop(store);
        let _ = std::fs::remove_file(&migrated);
    }

    #[test]
    fn replica_without_courseware_tables_is_rejected() {
        let path = temp_db_path("empty-replica");
        {
            let conn = match Connection::open(&path) {
                Ok(value) => value,
                Err(err) => panic!("failed to create empty db: {err}"),
            };
            if let Err(err) = conn.execute_batch("CREATE TABLE unrelated (id INTEGER);") {
                panic!("failed to create table: {err}");
            }
        }

        let result = SqliteCoursewareStore::open_read_only(&path);
        let err = match result {
            Ok(_) => panic!("expected schema check failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("courseware_studentmodule"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn commerce_configuration_defaults_when_empty() {
        let store = fixture_store();
        let current = must(store.current_commerce_configuration());
        assert_eq!(current, CommerceConfiguration::default());
        assert!(!current.enabled);
    }

    #[test]
    fn commerce_configuration_is_versioned() {
        let store = fixture_store();
        let site = must(store.upsert_site(
            "https://shop.example.com",
            "Shop",
            Some("/checkout/receipt/?order="),
        ));

        let mut input = CommerceConfigurationInput::from_current(&must(
            store.current_commerce_configuration(),
        ));
        input.enabled = true;
        input.changed_by = Some("staff".to_string());
        let first = must(store.save_commerce_configuration(&input));

        input.cache_ttl = 300;
        input.site_id = Some(site.id);
        let second = must(store.save_commerce_configuration(&input));

        let current = must(store.current_commerce_configuration());
        assert_eq!(current.id, second.id);
        assert!(current.is_cache_enabled());
        assert_eq!(
            current.receipt_page_url(),
            "https://shop.example.com/checkout/receipt/?order="
        );

        let history = must(store.commerce_configuration_history(None));
        let ids: Vec<Option<i64>> = history.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(must(store.commerce_configuration_history(Some(1))).len(), 1);

        let update = store.connection().execute(
            "UPDATE commerce_commerceconfiguration SET enabled = 0",
            [],
        );
        assert!(update.is_err());
    }

    #[test]
    fn commerce_configuration_rejects_unknown_site_and_long_paths() {
        let store = fixture_store();
        let mut input = CommerceConfigurationInput::from_current(&CommerceConfiguration::default());
        input.site_id = Some(99);
        assert!(store.save_commerce_configuration(&input).is_err());

        input.site_id = None;
        input.single_course_checkout_page = "x".repeat(256);
        assert!(store.save_commerce_configuration(&input).is_err());
    }

    #[test]
    fn unconfigured_site_falls_back_to_default_receipt_page() {
        let store = fixture_store();
        let site = must(store.upsert_site("https://bare.example.com", "Bare", None));
        assert!(site.configuration.is_none());

        let mut input = CommerceConfigurationInput::from_current(&CommerceConfiguration::default());
        input.site_id = Some(site.id);
        let saved = must(store.save_commerce_configuration(&input));
        assert_eq!(
            saved.receipt_page_url(),
            lms_courseware_core::DEFAULT_RECEIPT_PAGE_URL
        );
    }

    fn grade_from_code(code: u8) -> Option<f64> {
        match code {
            0 => None,
            value => Some(f64::from(value) / 4.0),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_reconcile_leaves_one_row_per_logical_key(
            rows in prop::collection::vec((0u8..3, 0u8..2, any::<bool>(), any::<bool>(), 0u8..5, 0u8..3), 1..24)
        ) {
            let store = fixture_store();
            let mut expected_keys = BTreeSet::new();

            for (student, block, malformed, with_history, grade_code, hour) in rows {
                let module_state_key = format!("block-v1:edX+DemoX+Demo_Course+type@problem+block@q{block}");
                let course_id = if malformed { newline_course() } else { COURSE.to_string() };
                let input = ProgressRecordInput {
                    student_id: i64::from(student),
                    course_id,
                    module_state_key: module_state_key.clone(),
                    module_type: "problem".to_string(),
                    grade: grade_from_code(grade_code),
                    max_grade: Some(1.0),
                    state: None,
                    done: false,
                    modified: Some(must_utc(&format!("2016-08-23T1{hour}:00:00Z"))),
                };
                // Duplicates of the same raw key are rejected by the unique index.
                if let Ok(id) = seed_raw_progress_record(store.connection(), &input) {
                    if with_history {
                        must(store.append_history(id, None, None, input.grade, None));
                    }
                    expected_keys.insert((i64::from(student), module_state_key));
                }
            }

            let first = run_window(&store, false);
            prop_assert_eq!(first.totals.error, 0);

            let mut remaining = BTreeMap::new();
            for student in 0..3 {
                for row in must(store.list_progress_for_student(student)) {
                    prop_assert!(!row.is_malformed());
                    let count = remaining
                        .entry((row.student_id, row.module_state_key.clone()))
                        .or_insert(0_usize);
                    *count += 1;
                }
            }
            prop_assert!(remaining.values().all(|count| *count == 1));
            prop_assert_eq!(remaining.len(), expected_keys.len());
            prop_assert_eq!(must(store.count_orphaned_history()), 0);

            let second = run_window(&store, false);
            prop_assert_eq!(second.rows_detected, 0);
            prop_assert_eq!(second.totals, FixResult::default());
        }
    }
}
