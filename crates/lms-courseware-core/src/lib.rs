//! Domain model and repair logic for courseware student-progress rows.
//!
//! The storage tier is reached only through [`CandidateSource`],
//! [`ProgressStore`] and [`HistoryStore`], so the reconciliation pipeline in
//! [`Reconciler`] runs unchanged against `SQLite` or an in-memory fake.

use std::cmp::Ordering;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod commerce;
mod reconcile;

pub use commerce::{
    CommerceConfiguration, CommerceConfigurationInput, Site, SiteConfiguration,
    COMMERCE_API_NAME, COMMERCE_CACHE_KEY, DEFAULT_RECEIPT_PAGE_URL,
    DEFAULT_SINGLE_COURSE_CHECKOUT_PAGE, MAX_CHECKOUT_PAGE_LEN,
};
pub use reconcile::{Reconciler, RunMode, RunReport};

/// Character that a past write bug appended to `course_id` values.
pub const CORRUPTING_SUFFIX: char = '\n';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoursewareError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Opaque failure reported by a storage backend.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StorageError(pub String);

impl StorageError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("progress record {0} no longer exists in the primary store")]
    RecordVanished(i64),
    #[error("failed to persist progress record {id}: {message}")]
    PersistenceFailure { id: i64, message: String },
    #[error("progress record {id} matches {count} rows with the normalized course_id")]
    AmbiguousConflict { id: i64, count: usize },
    #[error("invalid time window: start {start} is after end {end}")]
    InvalidWindow { start: String, end: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Strips the corrupting suffix from a course identifier.
///
/// Every write of `course_id` goes through this function, which is why a
/// malformed row can only be fixed in place when no correctly-keyed row
/// exists: the write would otherwise collide with it.
#[must_use]
pub fn normalize_identifier(raw: &str) -> &str {
    raw.trim_end_matches(CORRUPTING_SUFFIX)
}

#[must_use]
pub fn is_malformed_identifier(raw: &str) -> bool {
    raw.ends_with(CORRUPTING_SUFFIX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    pub id: i64,
    pub student_id: i64,
    pub course_id: String,
    pub module_state_key: String,
    pub module_type: String,
    pub grade: Option<f64>,
    pub max_grade: Option<f64>,
    pub state: Option<String>,
    pub done: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}

impl ProgressRecord {
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        is_malformed_identifier(&self.course_id)
    }

    #[must_use]
    pub fn normalized_course_id(&self) -> &str {
        normalize_identifier(&self.course_id)
    }

    /// Copies the learner-facing progress fields, leaving identity intact.
    pub fn copy_progress_from(&mut self, source: &ProgressRecord) {
        self.grade = source.grade;
        self.max_grade = source.max_grade;
        self.state.clone_from(&source.state);
        self.done = source.done;
    }
}

/// Fields for a new progress row; `modified` defaults to now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecordInput {
    pub student_id: i64,
    pub course_id: String,
    pub module_state_key: String,
    pub module_type: String,
    pub grade: Option<f64>,
    pub max_grade: Option<f64>,
    pub state: Option<String>,
    pub done: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub student_module_id: i64,
    pub version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub state: Option<String>,
    pub grade: Option<f64>,
    pub max_grade: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Correct,
    Malformed,
}

/// Picks which of two conflicting rows carries the data to keep.
///
/// Higher grade first, then the strictly more recent `modified`; the
/// correctly-keyed row wins every remaining tie. A missing grade orders
/// below any number and incomparable grades count as equal.
#[must_use]
pub fn select_winner(correct: &ProgressRecord, malformed: &ProgressRecord) -> Winner {
    match compare_grades(malformed.grade, correct.grade) {
        Ordering::Greater => return Winner::Malformed,
        Ordering::Less => return Winner::Correct,
        Ordering::Equal => {}
    }

    if malformed.modified > correct.modified {
        Winner::Malformed
    } else {
        Winner::Correct
    }
}

fn compare_grades(lhs: Option<f64>, rhs: Option<f64>) -> Ordering {
    lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
}

/// Per-row outcome of a repair attempt. Summing rows gives the run totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FixResult {
    pub record_trimmed: u64,
    pub data_copied: u64,
    pub record_deleted: u64,
    pub error: u64,
}

impl FixResult {
    #[must_use]
    pub fn trimmed() -> Self {
        Self {
            record_trimmed: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn copied_and_deleted() -> Self {
        Self {
            data_copied: 1,
            record_deleted: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn deleted() -> Self {
        Self {
            record_deleted: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn error() -> Self {
        Self {
            error: 1,
            ..Self::default()
        }
    }

    /// True when the indicators describe a single reachable row outcome.
    #[must_use]
    pub fn is_row_consistent(&self) -> bool {
        matches!(
            (
                self.record_trimmed,
                self.data_copied,
                self.record_deleted,
                self.error
            ),
            (0, 0, 0, 0) | (1, 0, 0, 0) | (0, 1, 1, 0) | (0, 0, 1, 0) | (0, 0, 0, 1)
        )
    }
}

impl Add for FixResult {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            record_trimmed: self.record_trimmed + rhs.record_trimmed,
            data_copied: self.data_copied + rhs.data_copied,
            record_deleted: self.record_deleted + rhs.record_deleted,
            error: self.error + rhs.error,
        }
    }
}

impl AddAssign for FixResult {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for FixResult {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Read path used to discover candidates. May lag the primary.
pub trait CandidateSource {
    /// Returns rows with a malformed `course_id` whose `modified` lies in
    /// `[start, end]`.
    ///
    /// # Errors
    /// Returns [`StorageError`] when the backing store cannot be queried.
    fn query_candidates(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<ProgressRecord>, StorageError>;
}

/// Authoritative, writable progress rows.
///
/// # Errors
/// Every method returns [`StorageError`] when the backend fails.
#[allow(clippy::missing_errors_doc)]
pub trait ProgressStore {
    fn get_by_id(&self, id: i64) -> Result<Option<ProgressRecord>, StorageError>;

    /// Rows keyed exactly by `(student_id, module_state_key, course_id)`,
    /// excluding `exclude_id`.
    fn find_conflicts(
        &self,
        student_id: i64,
        module_state_key: &str,
        course_id: &str,
        exclude_id: i64,
    ) -> Result<Vec<ProgressRecord>, StorageError>;

    /// Persists a row. Implementations store `course_id` through
    /// [`normalize_identifier`].
    fn save(&self, record: &ProgressRecord) -> Result<(), StorageError>;

    fn delete(&self, record: &ProgressRecord) -> Result<(), StorageError>;
}

/// Audit entries hanging off progress rows.
///
/// # Errors
/// Every method returns [`StorageError`] when the backend fails.
#[allow(clippy::missing_errors_doc)]
pub trait HistoryStore {
    fn history_for(&self, records: &[ProgressRecord]) -> Result<Vec<HistoryRecord>, StorageError>;

    fn delete_history(&self, entry: &HistoryRecord) -> Result<(), StorageError>;
}

/// Parses an RFC3339 timestamp and requires UTC.
///
/// # Errors
/// Returns [`CoursewareError::Validation`] when parsing fails or the offset
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoursewareError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| CoursewareError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoursewareError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses a window bound given either as RFC3339 (UTC) or as
/// `YYYY-MM-DD HH:MM:SS`, the latter interpreted as UTC.
///
/// # Errors
/// Returns [`CoursewareError::Validation`] when neither form matches.
pub fn parse_window_bound(value: &str) -> Result<OffsetDateTime, CoursewareError> {
    if let Ok(parsed) = parse_rfc3339_utc(value) {
        return Ok(parsed);
    }

    let format = time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
        .map_err(|err| CoursewareError::Validation(format!("invalid window format: {err}")))?;
    PrimitiveDateTime::parse(value.trim(), &format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| {
            CoursewareError::Validation(format!(
                "invalid timestamp {value:?}: expected RFC3339 or \"YYYY-MM-DD HH:MM:SS\" ({err})"
            ))
        })
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoursewareError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoursewareError> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339).map_err(|err| {
        CoursewareError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
    })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
