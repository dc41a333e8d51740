//! Runs the five triage stages for one invocation under a global deadline.

use std::fmt;

use log::{error, info, warn};
use tokio::time::{timeout_at, Instant};

use crate::config::Config;
use crate::error::{Result, TriageError};
use crate::model::{self, ModelClient};
use crate::output::PhaseProgress;
use crate::providers::GitHubClient;
use crate::triage::{
    Diagnosis, FailedJob, Outcome, PublishAction, PublishResult, RepositoryContext, RunReference,
    TriggerEvent,
};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locate,
    Fetch,
    Build,
    Invoke,
    Publish,
}

impl Stage {
    pub const COUNT: usize = 5;

    /// 1-based position in the pipeline.
    pub fn number(self) -> usize {
        match self {
            Stage::Locate => 1,
            Stage::Fetch => 2,
            Stage::Build => 3,
            Stage::Invoke => 4,
            Stage::Publish => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::Locate => "locating the failed job",
            Stage::Fetch => "fetching the job log",
            Stage::Build => "building the diagnostic request",
            Stage::Invoke => "invoking the model",
            Stage::Publish => "publishing the diagnosis",
        };
        f.write_str(text)
    }
}

/// One configured pipeline. Holds no per-invocation state, so a single
/// value can serve any number of sequential invocations.
pub struct Pipeline {
    config: Config,
    model: ModelClient,
    show_progress: bool,
}

impl Pipeline {
    /// Validates `config` and prepares the model client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration is inconsistent.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let model = ModelClient::new(
            &config.model,
            config.model_api_key(),
            config.model_timeout(),
            config.retry_policy(),
        )?;

        Ok(Self {
            config,
            model,
            show_progress: false,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn github(&self, run: &RunReference) -> Result<GitHubClient> {
        let token = self
            .config
            .github_token()
            .ok_or_else(|| TriageError::Config("a GitHub token is required".to_string()))?;
        GitHubClient::new(
            &self.config.github.base_url,
            &run.repository,
            token,
            self.config.request_timeout(),
            self.config.retry_policy(),
        )
    }

    /// Runs only the Log Locator for the event.
    pub async fn locate_only(&self, event: &TriggerEvent) -> Result<FailedJob> {
        let run = RunReference::from_event(event)?;
        let github = self.github(&run)?;
        let limit = self.config.global_timeout();

        timeout_at(Instant::now() + limit, github.locate(&run))
            .await
            .map_err(|_| TriageError::Timeout {
                run: run.clone(),
                stage: Stage::Locate,
                limit,
            })?
    }

    /// Processes one invocation and reports its single outcome.
    ///
    /// Locate, fetch, build and invoke share the global deadline; publishing
    /// gets whatever remains of it. A diagnosis that cannot be published is
    /// still returned, as a `PARTIAL` outcome.
    pub async fn run(&self, event: &TriggerEvent) -> Outcome {
        let limit = self.config.global_timeout();
        let deadline = Instant::now() + limit;

        let run = match RunReference::from_event(event) {
            Ok(run) => run,
            Err(e) => {
                error!("Rejected invocation: {e}");
                return Outcome::failure(&e);
            }
        };
        info!("Triaging {run}");

        let github = match self.github(&run) {
            Ok(github) => github,
            Err(e) => return Outcome::failure(&e),
        };

        let progress = PhaseProgress::start(self.show_progress);

        let diagnosis = match timeout_at(deadline, self.diagnose(&github, &run, &progress)).await {
            Ok(Ok(diagnosis)) => diagnosis,
            Ok(Err(e)) => {
                error!("Triage of {run} failed: {e}");
                progress.fail(&format!("{:?}", e.kind()));
                return Outcome::failure(&e);
            }
            Err(_) => {
                let e = TriageError::Timeout {
                    run: run.clone(),
                    stage: progress.current(),
                    limit,
                };
                error!("{e}");
                progress.fail("deadline exceeded");
                return Outcome::failure(&e);
            }
        };

        progress.enter(Stage::Publish);
        let outcome = match timeout_at(deadline, self.publish(&github, &run, &diagnosis)).await {
            Ok(Ok(result)) => {
                progress.finish();
                Outcome::success(diagnosis, result)
            }
            Ok(Err(e)) => {
                warn!("Diagnosis computed but not published: {e}");
                progress.fail("publish failed");
                Outcome::partial(diagnosis, &e)
            }
            Err(_) => {
                let e = TriageError::Timeout {
                    run: run.clone(),
                    stage: Stage::Publish,
                    limit,
                };
                warn!("Diagnosis computed but not published: {e}");
                progress.fail("deadline exceeded");
                Outcome::partial(diagnosis, &e)
            }
        };

        info!("Triage of {run} finished with {:?}", outcome.status);
        outcome
    }

    async fn diagnose(
        &self,
        github: &GitHubClient,
        run: &RunReference,
        progress: &PhaseProgress,
    ) -> Result<Diagnosis> {
        let triage = &self.config.triage;

        progress.enter(Stage::Locate);
        let job = github.locate(run).await?;

        progress.enter(Stage::Fetch);
        let log = github.fetch_log(run, &job, triage.max_log_bytes).await?;
        info!(
            "Fetched {} bytes of log for job '{}'{}",
            log.raw_len,
            job.name,
            if log.truncated { " (cut at the size cap)" } else { "" }
        );

        let context = self.repository_context(github, run, &job).await;

        progress.enter(Stage::Build);
        let request = model::build(run, &job, &log, triage.budget_chars, triage.head_chars)
            .with_context(context);
        if request.truncated {
            info!(
                "Log of job '{}' exceeds the {}-character budget ({} characters omitted)",
                job.name, request.budget_chars, request.omitted_chars
            );
        }

        progress.enter(Stage::Invoke);
        self.model.invoke(&request).await
    }

    /// Repository files for the model, when enabled. Never fails the run.
    async fn repository_context(
        &self,
        github: &GitHubClient,
        run: &RunReference,
        job: &FailedJob,
    ) -> Option<RepositoryContext> {
        let settings = &self.config.context;
        if !settings.enabled {
            return None;
        }
        let git_ref = if run.branch.is_empty() {
            job.head_sha.clone()?
        } else {
            run.branch.clone()
        };

        match github
            .fetch_repository_context(&git_ref, &settings.extensions, settings.max_chars)
            .await
        {
            Ok(context) => Some(context),
            Err(failure) => {
                warn!(
                    "Continuing without repository files after {} attempt(s): {}",
                    failure.attempts, failure.error
                );
                None
            }
        }
    }

    async fn publish(
        &self,
        github: &GitHubClient,
        run: &RunReference,
        diagnosis: &Diagnosis,
    ) -> Result<PublishResult> {
        let publish = &self.config.publish;
        if !publish.enabled {
            info!("Publishing disabled, keeping diagnosis local");
            return Ok(PublishResult {
                action: PublishAction::Skipped,
                destination: "none".to_string(),
                comment_id: None,
                url: None,
            });
        }
        github
            .publish_diagnosis(run, diagnosis, publish.dry_run)
            .await
    }
}
