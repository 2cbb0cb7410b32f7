use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::{
    format_rfc3339, select_winner, CandidateSource, FixResult, HistoryStore, ProgressRecord,
    ProgressStore, ReconcileError, StorageError, Winner,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Real,
}

impl RunMode {
    #[must_use]
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Self::DryRun
        } else {
            Self::Real
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Real => "real",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub mode: RunMode,
    pub rows_detected: usize,
    pub totals: FixResult,
}

/// Repairs progress rows whose `course_id` carries a trailing newline.
///
/// Candidates come from `read_path`, which may be a lagging replica; every
/// decision and write is made against `primary`.
pub struct Reconciler<'a, R: ?Sized, P: ?Sized> {
    read_path: &'a R,
    primary: &'a P,
}

impl<'a, R, P> Reconciler<'a, R, P>
where
    R: CandidateSource + ?Sized,
    P: ProgressStore + HistoryStore + ?Sized,
{
    #[must_use]
    pub fn new(read_path: &'a R, primary: &'a P) -> Self {
        Self { read_path, primary }
    }

    /// Scans `[start, end]` and repairs every candidate independently.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidWindow`] when `start > end` and
    /// [`ReconcileError::Storage`] when the candidate query fails. Per-row
    /// failures never surface here; they are counted in
    /// [`FixResult::error`].
    pub fn run(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        dry_run: bool,
    ) -> Result<RunReport, ReconcileError> {
        if start > end {
            return Err(ReconcileError::InvalidWindow {
                start: format_rfc3339(start).unwrap_or_else(|_| start.to_string()),
                end: format_rfc3339(end).unwrap_or_else(|_| end.to_string()),
            });
        }

        let mode = RunMode::from_dry_run(dry_run);
        info!(mode = mode.as_str(), "starting fix of newline course ids");

        let candidates = self.read_path.query_candidates(start, end)?;
        let totals: FixResult = candidates
            .iter()
            .map(|candidate| self.fix_record(candidate, dry_run))
            .sum();

        info!(mode = mode.as_str(), "finished fix of newline course ids");
        info!(rows_detected = candidates.len(), ?totals, "fix results");

        Ok(RunReport {
            mode,
            rows_detected: candidates.len(),
            totals,
        })
    }

    /// Repairs a single candidate. Never fails; errors become
    /// `FixResult { error: 1, .. }`.
    pub fn fix_record(&self, candidate: &ProgressRecord, dry_run: bool) -> FixResult {
        let result = match self.try_fix_record(candidate, dry_run) {
            Ok(result) => result,
            Err(err) => {
                error!(row_id = candidate.id, error = %err, "failed to fix progress row");
                FixResult::error()
            }
        };
        debug_assert!(result.is_row_consistent(), "inconsistent row outcome: {result:?}");
        result
    }

    fn try_fix_record(
        &self,
        candidate: &ProgressRecord,
        dry_run: bool,
    ) -> Result<FixResult, ReconcileError> {
        // The candidate came from the read path, so re-read before writing.
        let Some(malformed) = self.primary.get_by_id(candidate.id)? else {
            return Err(ReconcileError::RecordVanished(candidate.id));
        };

        if !malformed.is_malformed() {
            warn!(
                row_id = malformed.id,
                "progress row already has a clean course_id in the primary; skipping"
            );
            return Ok(FixResult::default());
        }

        let mut conflicts = self.primary.find_conflicts(
            malformed.student_id,
            &malformed.module_state_key,
            malformed.normalized_course_id(),
            malformed.id,
        )?;
        if conflicts.len() > 1 {
            return Err(ReconcileError::AmbiguousConflict {
                id: malformed.id,
                count: conflicts.len(),
            });
        }

        let Some(mut correct) = conflicts.pop() else {
            return self.trim_in_place(malformed, dry_run);
        };

        match select_winner(&correct, &malformed) {
            Winner::Malformed => {
                info!(
                    from_row = malformed.id,
                    to_row = correct.id,
                    module_type = %malformed.module_type,
                    module_state_key = %malformed.module_state_key,
                    "conflict: keeping data from newline course row"
                );
                correct.copy_progress_from(&malformed);
                if dry_run {
                    return Ok(FixResult::copied_and_deleted());
                }

                self.primary
                    .save(&correct)
                    .map_err(|err| persistence_failure(correct.id, &err))?;
                self.delete_with_history(&malformed)
                    .map_err(|err| persistence_failure(malformed.id, &err))?;
                Ok(FixResult::copied_and_deleted())
            }
            Winner::Correct => {
                info!(
                    kept_row = correct.id,
                    deleted_row = malformed.id,
                    module_type = %malformed.module_type,
                    module_state_key = %malformed.module_state_key,
                    "conflict: keeping row with correct course_id"
                );
                if dry_run {
                    return Ok(FixResult::deleted());
                }

                self.delete_with_history(&malformed)
                    .map_err(|err| persistence_failure(malformed.id, &err))?;
                Ok(FixResult::deleted())
            }
        }
    }

    fn trim_in_place(
        &self,
        mut malformed: ProgressRecord,
        dry_run: bool,
    ) -> Result<FixResult, ReconcileError> {
        info!(
            row_id = malformed.id,
            module_type = %malformed.module_type,
            module_state_key = %malformed.module_state_key,
            "no conflict: removing trailing newline from course_id"
        );
        if dry_run {
            return Ok(FixResult::trimmed());
        }

        malformed.course_id = malformed.normalized_course_id().to_string();
        self.primary
            .save(&malformed)
            .map_err(|err| persistence_failure(malformed.id, &err))?;
        Ok(FixResult::trimmed())
    }

    /// History entries go first so none is left pointing at a missing row.
    fn delete_with_history(&self, record: &ProgressRecord) -> Result<(), StorageError> {
        for entry in self.primary.history_for(std::slice::from_ref(record))? {
            self.primary.delete_history(&entry)?;
        }
        self.primary.delete(record)
    }
}

fn persistence_failure(id: i64, err: &StorageError) -> ReconcileError {
    ReconcileError::PersistenceFailure {
        id,
        message: err.to_string(),
    }
}
