use url::Url;

use crate::error::{Result, TriageError};

/// Run and job identifiers found in a logs URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogsTarget {
    pub run_id: Option<u64>,
    pub job_id: Option<u64>,
}

/// Extracts run and job identifiers from a logs handle.
///
/// Accepts API links (`/repos/{owner}/{repo}/actions/runs/{id}/logs`,
/// `/repos/{owner}/{repo}/actions/jobs/{id}/logs`) as well as web UI links
/// (`https://github.com/{owner}/{repo}/actions/runs/{run}/job/{job}`).
///
/// # Errors
///
/// Returns a configuration error if the handle is not an absolute URL.
pub fn parse_logs_url(logs_url: &str) -> Result<LogsTarget> {
    let url = Url::parse(logs_url.trim())
        .map_err(|e| TriageError::Config(format!("Invalid logs_url '{logs_url}': {e}")))?;

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let mut target = LogsTarget::default();
    for pair in segments.windows(2) {
        let Ok(id) = pair[1].parse::<u64>() else {
            continue;
        };
        match pair[0] {
            "runs" => target.run_id = Some(id),
            "jobs" | "job" => target.job_id = Some(id),
            _ => {}
        }
    }

    Ok(target)
}

/// API URL from which a job's raw log is downloaded.
pub fn job_logs_url(api_base: &str, repository: &str, job_id: u64) -> String {
    format!(
        "{}/repos/{repository}/actions/jobs/{job_id}/logs",
        api_base.trim_end_matches('/')
    )
}

/// Web UI origin served alongside an API base URL.
///
/// `https://api.github.com` maps to `https://github.com`, an Enterprise
/// Server base such as `https://ghe.example.com/api/v3` to its host.
pub fn web_base_url(api_base: &str) -> String {
    let api_base = api_base.trim_end_matches('/');
    let Ok(url) = Url::parse(api_base) else {
        return api_base.to_string();
    };

    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("api.").unwrap_or(host);
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    let path = path.strip_suffix("/api/v3").unwrap_or(path);

    format!("{}://{host}{port}{path}", url.scheme())
}

/// Web URL for a workflow run.
pub fn workflow_run_url(web_base: &str, repository: &str, run_id: u64) -> String {
    format!(
        "{}/{repository}/actions/runs/{run_id}",
        web_base.trim_end_matches('/')
    )
}
