use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::Token;
use crate::error::{CallError, TriageError};
use crate::retry::{RetryFailure, RetryPolicy};

use super::links::web_base_url;
use super::types::{GitHubJob, WorkflowJobsResponse};

pub(super) const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 20;

pub type CallResult<T> = std::result::Result<T, RetryFailure<CallError>>;

/// GitHub REST client for one repository.
///
/// Every request carries the bearer token and goes through the shared
/// retry policy; a single attempt is bounded by the request timeout.
#[derive(Clone)]
pub struct GitHubClient {
    /// HTTP client
    client: reqwest::Client,
    /// Base URL for GitHub API
    base_url: String,
    /// Repository in `owner/name` form
    repository: String,
    token: Token,
    retry: RetryPolicy,
}

impl GitHubClient {
    /// Create a new GitHub API client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - GitHub API base URL (e.g., "https://api.github.com")
    /// * `repository` - Repository path in format "owner/repo"
    /// * `token` - GitHub personal access token
    /// * `request_timeout` - Upper bound for a single HTTP attempt
    /// * `retry` - Backoff applied to transient failures
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        repository: &str,
        token: Token,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> crate::error::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let client = reqwest::Client::builder()
            .user_agent(concat!("citriage/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TriageError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            token,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Web UI origin matching the API base, for links in comments.
    pub fn web_base_url(&self) -> String {
        web_base_url(&self.base_url)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(super) fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.base_url, self.repository, path)
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(self.token.as_str())
    }

    /// One authenticated request; non-success statuses become [`CallError`].
    pub(super) async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&impl Serialize>,
    ) -> std::result::Result<Response, CallError> {
        let mut request = self.auth_request(self.client.request(method, url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        check_status(response).await
    }

    pub(super) async fn json_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&impl Serialize>,
    ) -> std::result::Result<T, CallError> {
        let response = self.send_once(method, url, body).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// GET with retry on transient failures.
    pub(super) async fn get_json<T: DeserializeOwned>(&self, what: &str, url: &str) -> CallResult<T> {
        self.retry
            .run(
                what,
                move |attempt| {
                    debug!("GET {url} (attempt {attempt})");
                    self.json_once(Method::GET, url, None::<&()>)
                },
                CallError::is_transient,
            )
            .await
    }

    async fn raw_once(&self, url: &str) -> std::result::Result<String, CallError> {
        let request = self
            .auth_request(self.client.get(url))
            .header(ACCEPT, "application/vnd.github.raw+json");
        let response = check_status(request.send().await?).await?;
        Ok(response.text().await?)
    }

    /// GET of a file's raw content with retry on transient failures.
    pub(super) async fn get_raw(&self, what: &str, url: &str) -> CallResult<String> {
        self.retry
            .run(
                what,
                move |attempt| {
                    debug!("GET {url} raw (attempt {attempt})");
                    self.raw_once(url)
                },
                CallError::is_transient,
            )
            .await
    }

    /// Fetch a single job by id.
    pub async fn get_job(&self, job_id: u64) -> CallResult<GitHubJob> {
        let url = self.repo_url(&format!("actions/jobs/{job_id}"));
        self.get_json("fetch job", &url).await
    }

    /// Fetch every job of a workflow run, following pagination.
    ///
    /// Jobs are returned in the order GitHub lists them; that order defines
    /// the ordinal used to break start-time ties.
    pub async fn list_run_jobs(&self, run_id: u64) -> CallResult<Vec<GitHubJob>> {
        let mut all_jobs = Vec::new();

        for page in 1..=MAX_PAGES {
            let url = self.repo_url(&format!(
                "actions/runs/{run_id}/jobs?per_page={PAGE_SIZE}&page={page}"
            ));
            let response: WorkflowJobsResponse = self.get_json("list run jobs", &url).await?;

            let response_len = response.jobs.len();
            all_jobs.extend(response.jobs);

            if response_len < PAGE_SIZE || all_jobs.len() >= response.total_count {
                break;
            }
        }

        debug!("Run {run_id} has {} jobs", all_jobs.len());
        Ok(all_jobs)
    }
}

/// Maps error statuses, treating an exhausted rate limit as throttling.
async fn check_status(response: Response) -> std::result::Result<Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let rate_limited = status == StatusCode::FORBIDDEN
        && response
            .headers()
            .get("x-ratelimit-remaining")
            .is_some_and(|v| v.as_bytes() == b"0");

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());

    if rate_limited {
        return Err(CallError::from_status(429, &body));
    }
    Err(CallError::from_status(status.as_u16(), &body))
}
