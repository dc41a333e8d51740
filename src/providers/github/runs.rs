//! Log Locator: picks the one failed job to diagnose.

use log::{debug, info};

use crate::error::{CallError, Result, TriageError};
use crate::pipeline::Stage;
use crate::retry::RetryFailure;
use crate::triage::{FailedJob, RunHandle, RunReference};

use super::client::GitHubClient;
use super::links::job_logs_url;
use super::types::GitHubJob;

/// Selects the earliest-started failed job.
///
/// Jobs without a start time sort after every started job; equal start
/// times fall back to the position in `jobs`. Returns the ordinal together
/// with the job, or `None` when nothing failed.
pub fn select_failed_job(jobs: &[GitHubJob]) -> Option<(usize, &GitHubJob)> {
    jobs.iter()
        .enumerate()
        .filter(|(_, job)| job.is_failed())
        .min_by_key(|(ordinal, job)| (job.started_at.is_none(), job.started_at, *ordinal))
}

impl GitHubClient {
    /// Resolves the run reference to a single failed job.
    ///
    /// A job handle is honored when that job failed; otherwise the job's run
    /// is searched like a run handle.
    ///
    /// # Errors
    ///
    /// - `NotFound` when the run has no failed job or does not exist
    /// - `AuthError` when the token is rejected
    /// - `FetchError` when the job listing cannot be retrieved
    pub async fn locate(&self, run: &RunReference) -> Result<FailedJob> {
        let (run_id, requested_job) = match run.handle {
            RunHandle::Run(run_id) => (run_id, None),
            RunHandle::Job(job_id) => {
                let job = self
                    .get_job(job_id)
                    .await
                    .map_err(|failure| lookup_error(run, failure))?;
                (job.run_id, Some(job_id))
            }
        };

        let jobs = self
            .list_run_jobs(run_id)
            .await
            .map_err(|failure| lookup_error(run, failure))?;

        let requested = requested_job.and_then(|id| {
            jobs.iter()
                .enumerate()
                .find(|(_, job)| job.id == id && job.is_failed())
        });
        if requested_job.is_some() && requested.is_none() {
            debug!("Requested job did not fail, searching run {run_id} instead");
        }

        let (ordinal, job) = requested
            .or_else(|| select_failed_job(&jobs))
            .ok_or_else(|| TriageError::NotFound { run: run.clone() })?;

        info!(
            "Selected failed job '{}' ({}) at position {} of {}",
            job.name,
            job.id,
            ordinal,
            jobs.len()
        );

        Ok(FailedJob {
            id: job.id,
            run_id,
            name: job.name.clone(),
            ordinal,
            logs_url: job_logs_url(self.base_url(), self.repository(), job.id),
            head_sha: job.head_sha.clone(),
            html_url: job.html_url.clone(),
            started_at: job.started_at,
        })
    }
}

fn lookup_error(run: &RunReference, failure: RetryFailure<CallError>) -> TriageError {
    match failure.error {
        CallError::NotFound(_) => TriageError::NotFound { run: run.clone() },
        CallError::Unauthorized(_) => TriageError::Auth {
            run: run.clone(),
            stage: Stage::Locate,
            source: failure.error,
        },
        error => TriageError::Fetch {
            run: run.clone(),
            attempts: failure.attempts,
            source: error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn job(id: u64, conclusion: Option<&str>, started_at: Option<&str>) -> GitHubJob {
        GitHubJob {
            id,
            run_id: 1,
            name: format!("job-{id}"),
            status: "completed".to_string(),
            conclusion: conclusion.map(ToString::to_string),
            started_at: started_at.map(|s| s.parse::<DateTime<Utc>>().unwrap()),
            completed_at: None,
            head_sha: None,
            html_url: None,
        }
    }

    #[test]
    fn returns_none_without_failures() {
        let jobs = vec![
            job(1, Some("success"), Some("2024-05-01T10:00:00Z")),
            job(2, Some("skipped"), None),
            job(3, None, None),
        ];
        assert!(select_failed_job(&jobs).is_none());
    }

    #[test]
    fn picks_the_only_failure() {
        let jobs = vec![
            job(1, Some("success"), Some("2024-05-01T10:00:00Z")),
            job(2, Some("failure"), Some("2024-05-01T10:05:00Z")),
            job(3, Some("skipped"), None),
        ];
        let (ordinal, selected) = select_failed_job(&jobs).unwrap();
        assert_eq!(ordinal, 1);
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn earliest_start_wins_regardless_of_order() {
        let base = vec![
            job(10, Some("failure"), Some("2024-05-01T10:09:00Z")),
            job(11, Some("failure"), Some("2024-05-01T10:01:00Z")),
            job(12, Some("success"), Some("2024-05-01T10:00:00Z")),
            job(13, Some("failed"), Some("2024-05-01T10:05:00Z")),
        ];

        // Every rotation of the listing must select the same job
        for shift in 0..base.len() {
            let mut jobs = base.clone();
            jobs.rotate_left(shift);
            let (_, selected) = select_failed_job(&jobs).unwrap();
            assert_eq!(selected.id, 11, "rotation {shift}");
        }

        let mut reversed = base.clone();
        reversed.reverse();
        assert_eq!(select_failed_job(&reversed).unwrap().1.id, 11);
    }

    #[test]
    fn ties_break_on_lowest_ordinal() {
        let jobs = vec![
            job(20, Some("failure"), Some("2024-05-01T10:00:00Z")),
            job(21, Some("failure"), Some("2024-05-01T10:00:00Z")),
        ];
        let (ordinal, selected) = select_failed_job(&jobs).unwrap();
        assert_eq!(ordinal, 0);
        assert_eq!(selected.id, 20);
    }

    #[test]
    fn unstarted_failures_sort_last() {
        let jobs = vec![
            job(30, Some("failure"), None),
            job(31, Some("failure"), Some("2024-05-01T12:00:00Z")),
        ];
        assert_eq!(select_failed_job(&jobs).unwrap().1.id, 31);
    }

    #[test]
    fn conclusion_matching_is_case_insensitive() {
        let jobs = vec![job(40, Some("FAILURE"), Some("2024-05-01T12:00:00Z"))];
        assert_eq!(select_failed_job(&jobs).unwrap().1.id, 40);
    }
}
