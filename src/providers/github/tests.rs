use std::time::Duration;

use chrono::Utc;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;

use super::publish::{marker, render_comment};
use super::GitHubClient;
use crate::auth::Token;
use crate::error::{CallError, ErrorKind, TriageError};
use crate::retry::RetryPolicy;
use crate::triage::{
    CauseCategory, Confidence, Diagnosis, FailedJob, PublishAction, RunHandle, RunReference,
};

const REPO: &str = "acme/infra";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        factor: 2,
        max_delay: Duration::from_millis(4),
    }
}

fn client(server: &ServerGuard) -> GitHubClient {
    GitHubClient::new(
        &server.url(),
        REPO,
        Token::from("ghp_test"),
        Duration::from_secs(5),
        fast_retry(),
    )
    .unwrap()
}

fn run_ref(handle: RunHandle) -> RunReference {
    RunReference {
        repository: REPO.to_string(),
        branch: "main".to_string(),
        handle,
    }
}

fn jobs_body() -> String {
    json!({
        "total_count": 3,
        "jobs": [
            {"id": 1, "run_id": 42, "name": "build", "status": "completed",
             "conclusion": "success", "started_at": "2024-05-01T10:00:00Z",
             "completed_at": "2024-05-01T10:02:00Z"},
            {"id": 2, "run_id": 42, "name": "test", "status": "completed",
             "conclusion": "failure", "started_at": "2024-05-01T10:03:00Z",
             "completed_at": "2024-05-01T10:05:00Z", "head_sha": "abc123",
             "html_url": "https://github.com/acme/infra/actions/runs/42/job/2"},
            {"id": 3, "run_id": 42, "name": "deploy", "status": "completed",
             "conclusion": "skipped", "started_at": null, "completed_at": null}
        ]
    })
    .to_string()
}

fn failed_job(server: &ServerGuard) -> FailedJob {
    FailedJob {
        id: 2,
        run_id: 42,
        name: "test".to_string(),
        ordinal: 1,
        logs_url: format!("{}/repos/{REPO}/actions/jobs/2/logs", server.url()),
        head_sha: Some("abc123".to_string()),
        html_url: None,
        started_at: None,
    }
}

fn diagnosis(server: &ServerGuard) -> Diagnosis {
    Diagnosis {
        summary: "Unit test `parses_config` fails on a missing fixture.".to_string(),
        category: CauseCategory::CodeDefect,
        confidence: Confidence::Medium,
        remediation: Some("Commit tests/fixtures/config.toml".to_string()),
        partial: false,
        run: run_ref(RunHandle::Run(42)),
        job: failed_job(server),
        model: "gpt-4o-mini".to_string(),
        generated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_locate_selects_failed_job_from_run() {
    let mut server = Server::new_async().await;
    let jobs = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer ghp_test")
        .with_status(200)
        .with_body(jobs_body())
        .expect(1)
        .create_async()
        .await;

    let job = client(&server)
        .locate(&run_ref(RunHandle::Run(42)))
        .await
        .unwrap();

    jobs.assert_async().await;
    assert_eq!(job.id, 2);
    assert_eq!(job.name, "test");
    assert_eq!(job.ordinal, 1);
    assert_eq!(job.head_sha.as_deref(), Some("abc123"));
    assert!(job.logs_url.ends_with("/repos/acme/infra/actions/jobs/2/logs"));
}

#[tokio::test]
async fn test_locate_job_handle_falls_back_to_run_selection() {
    let mut server = Server::new_async().await;
    // Handle names the successful build job; the failed test job wins
    let _job = server
        .mock("GET", "/repos/acme/infra/actions/jobs/1")
        .with_status(200)
        .with_body(
            json!({"id": 1, "run_id": 42, "name": "build", "status": "completed",
                   "conclusion": "success", "started_at": "2024-05-01T10:00:00Z",
                   "completed_at": null})
            .to_string(),
        )
        .create_async()
        .await;
    let _jobs = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(jobs_body())
        .create_async()
        .await;

    let job = client(&server)
        .locate(&run_ref(RunHandle::Job(1)))
        .await
        .unwrap();

    assert_eq!(job.id, 2);
    assert_eq!(job.run_id, 42);
}

#[tokio::test]
async fn test_locate_without_failures_is_not_found() {
    let mut server = Server::new_async().await;
    let _jobs = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"total_count": 1, "jobs": [
                {"id": 1, "run_id": 42, "name": "build", "status": "completed",
                 "conclusion": "success", "started_at": "2024-05-01T10:00:00Z",
                 "completed_at": null}
            ]})
            .to_string(),
        )
        .create_async()
        .await;

    let err = client(&server)
        .locate(&run_ref(RunHandle::Run(42)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.run(), Some(&run_ref(RunHandle::Run(42))));
}

#[tokio::test]
async fn test_locate_rejected_token_is_auth_error() {
    let mut server = Server::new_async().await;
    let jobs = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_body(r#"{"message":"Bad credentials"}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server)
        .locate(&run_ref(RunHandle::Run(42)))
        .await
        .unwrap_err();

    jobs.assert_async().await;
    assert_eq!(err.kind(), ErrorKind::AuthError);
}

#[tokio::test]
async fn test_fetch_log_normalizes_body() {
    let mut server = Server::new_async().await;
    let raw = "\x1b[36m##[group]Run cargo test\x1b[0m\r\nerror: test failed\r\n";
    let _logs = server
        .mock("GET", "/repos/acme/infra/actions/jobs/2/logs")
        .with_status(200)
        .with_body(raw)
        .create_async()
        .await;

    let log = client(&server)
        .fetch_log(&run_ref(RunHandle::Run(42)), &failed_job(&server), 1024)
        .await
        .unwrap();

    assert_eq!(log.text, "##[group]Run cargo test\nerror: test failed\n");
    assert!(!log.truncated);
    assert_eq!(log.raw_len, raw.len());
}

#[tokio::test]
async fn test_fetch_log_unauthorized_is_not_retried() {
    let mut server = Server::new_async().await;
    let logs = server
        .mock("GET", "/repos/acme/infra/actions/jobs/2/logs")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server)
        .fetch_log(&run_ref(RunHandle::Run(42)), &failed_job(&server), 1024)
        .await
        .unwrap_err();

    logs.assert_async().await;
    assert!(matches!(
        err,
        TriageError::Auth {
            source: CallError::Unauthorized(401),
            ..
        }
    ));
}

#[tokio::test]
async fn test_fetch_log_gives_up_after_retry_bound() {
    let mut server = Server::new_async().await;
    let logs = server
        .mock("GET", "/repos/acme/infra/actions/jobs/2/logs")
        .with_status(503)
        .with_body("unavailable")
        .expect(3)
        .create_async()
        .await;

    let err = client(&server)
        .fetch_log(&run_ref(RunHandle::Run(42)), &failed_job(&server), 1024)
        .await
        .unwrap_err();

    logs.assert_async().await;
    match err {
        TriageError::Fetch { attempts, source, .. } => {
            assert_eq!(attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("expected FetchError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fetch_log_keeps_tail_under_byte_cap() {
    let mut server = Server::new_async().await;
    let body: String = (0..200).map(|i| format!("line {i:03}\n")).collect();
    let _logs = server
        .mock("GET", "/repos/acme/infra/actions/jobs/2/logs")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let log = client(&server)
        .fetch_log(&run_ref(RunHandle::Run(42)), &failed_job(&server), 100)
        .await
        .unwrap();

    assert!(log.truncated);
    assert_eq!(log.raw_len, body.len());
    assert!(log.text.ends_with("line 199\n"));
    // The partial line left by the byte cut is dropped
    assert!(log.text.starts_with("line "));
    assert!(log.text.len() <= 100);
}

#[tokio::test]
async fn test_fetch_log_cap_on_line_boundary_keeps_whole_lines() {
    let mut server = Server::new_async().await;
    let body: String = (0..10).map(|i| format!("line-{i:03}.\n")).collect();
    let _logs = server
        .mock("GET", "/repos/acme/infra/actions/jobs/2/logs")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let log = client(&server)
        .fetch_log(&run_ref(RunHandle::Run(42)), &failed_job(&server), 30)
        .await
        .unwrap();

    assert!(log.truncated);
    assert_eq!(log.raw_len, 100);
    assert_eq!(log.text, "line-007.\nline-008.\nline-009.\n");
}

#[tokio::test]
async fn test_publish_twice_leaves_one_comment() {
    let mut server = Server::new_async().await;
    let diagnosis = diagnosis(&server);
    let body = render_comment(&diagnosis, &server.url());

    let _run = server
        .mock("GET", "/repos/acme/infra/actions/runs/42")
        .with_status(200)
        .with_body(
            json!({"id": 42, "head_sha": "abc123", "pull_requests": [{"number": 12}]})
                .to_string(),
        )
        .expect(2)
        .create_async()
        .await;
    // First listing is empty, the second one sees the created comment
    let _empty = server
        .mock("GET", "/repos/acme/infra/issues/12/comments")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;
    let _existing = server
        .mock("GET", "/repos/acme/infra/issues/12/comments")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!([{"id": 900, "body": body}]).to_string())
        .expect(1)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/repos/acme/infra/issues/12/comments")
        .match_body(Matcher::PartialJson(json!({"body": body})))
        .with_status(201)
        .with_body(
            json!({"id": 900, "body": body,
                   "html_url": "https://github.com/acme/infra/pull/12#issuecomment-900"})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let github = client(&server);
    let run = run_ref(RunHandle::Run(42));

    let first = github.publish_diagnosis(&run, &diagnosis, false).await.unwrap();
    assert_eq!(first.action, PublishAction::Created);
    assert_eq!(first.destination, "pull/12");
    assert_eq!(first.comment_id, Some(900));

    let second = github.publish_diagnosis(&run, &diagnosis, false).await.unwrap();
    assert_eq!(second.action, PublishAction::Unchanged);
    assert_eq!(second.comment_id, Some(900));

    create.assert_async().await;
}

#[tokio::test]
async fn test_publish_updates_stale_comment_on_commit() {
    let mut server = Server::new_async().await;
    let diagnosis = diagnosis(&server);
    let stale = format!("old analysis\n{}", marker(42, 2));

    let _run = server
        .mock("GET", "/repos/acme/infra/actions/runs/42")
        .with_status(200)
        .with_body(json!({"id": 42, "head_sha": "abc123", "pull_requests": []}).to_string())
        .create_async()
        .await;
    let _list = server
        .mock("GET", "/repos/acme/infra/commits/abc123/comments")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!([
                {"id": 5, "body": "unrelated"},
                {"id": 6, "body": stale}
            ])
            .to_string(),
        )
        .create_async()
        .await;
    let update = server
        .mock("PATCH", "/repos/acme/infra/comments/6")
        .with_status(200)
        .with_body(json!({"id": 6, "body": "new"}).to_string())
        .expect(1)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/repos/acme/infra/commits/abc123/comments")
        .expect(0)
        .create_async()
        .await;

    let result = client(&server)
        .publish_diagnosis(&run_ref(RunHandle::Run(42)), &diagnosis, false)
        .await
        .unwrap();

    update.assert_async().await;
    create.assert_async().await;
    assert_eq!(result.action, PublishAction::Updated);
    assert_eq!(result.destination, "commit/abc123");
    assert_eq!(result.comment_id, Some(6));
}

#[tokio::test]
async fn test_publish_dry_run_writes_nothing() {
    let mut server = Server::new_async().await;
    let diagnosis = diagnosis(&server);

    let _run = server
        .mock("GET", "/repos/acme/infra/actions/runs/42")
        .with_status(200)
        .with_body(json!({"id": 42, "head_sha": "abc123", "pull_requests": []}).to_string())
        .create_async()
        .await;
    let create = server
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let result = client(&server)
        .publish_diagnosis(&run_ref(RunHandle::Run(42)), &diagnosis, true)
        .await
        .unwrap();

    create.assert_async().await;
    assert_eq!(result.action, PublishAction::DryRun);
    assert_eq!(result.comment_id, None);
}

#[tokio::test]
async fn test_publish_forbidden_is_publish_error() {
    let mut server = Server::new_async().await;
    let diagnosis = diagnosis(&server);

    let run = server
        .mock("GET", "/repos/acme/infra/actions/runs/42")
        .with_status(403)
        .with_body(r#"{"message":"Resource not accessible by integration"}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server)
        .publish_diagnosis(&run_ref(RunHandle::Run(42)), &diagnosis, false)
        .await
        .unwrap_err();

    run.assert_async().await;
    assert_eq!(err.kind(), ErrorKind::PublishError);
}

#[tokio::test]
async fn test_rate_limited_403_is_retried() {
    let mut server = Server::new_async().await;
    let limited = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(403)
        .with_header("x-ratelimit-remaining", "0")
        .expect(1)
        .create_async()
        .await;
    let _ok = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(jobs_body())
        .create_async()
        .await;

    let job = client(&server)
        .locate(&run_ref(RunHandle::Run(42)))
        .await
        .unwrap();

    limited.assert_async().await;
    assert_eq!(job.id, 2);
}

fn job_json(id: u64, name: &str, conclusion: &str, started_at: &str) -> serde_json::Value {
    json!({"id": id, "run_id": 42, "name": name, "status": "completed",
           "conclusion": conclusion, "started_at": started_at, "completed_at": null})
}

#[tokio::test]
async fn test_locate_follows_job_pagination() {
    let mut server = Server::new_async().await;
    let first_page: Vec<_> = (0..100)
        .map(|i| job_json(1000 + i, &format!("shard-{i}"), "success", "2024-05-01T10:00:00Z"))
        .collect();
    let page_one = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("per_page".into(), "100".into()),
            Matcher::UrlEncoded("page".into(), "1".into()),
        ]))
        .with_status(200)
        .with_body(json!({"total_count": 101, "jobs": first_page}).to_string())
        .expect(1)
        .create_async()
        .await;
    let page_two = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
        .with_status(200)
        .with_body(
            json!({"total_count": 101, "jobs": [
                job_json(1100, "integration", "failure", "2024-05-01T10:07:00Z")
            ]})
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let job = client(&server)
        .locate(&run_ref(RunHandle::Run(42)))
        .await
        .unwrap();

    page_one.assert_async().await;
    page_two.assert_async().await;
    assert_eq!(job.id, 1100);
    assert_eq!(job.ordinal, 100);
}

#[tokio::test]
async fn test_locate_honors_failed_job_handle() {
    let mut server = Server::new_async().await;
    // Job 4 failed after job 2; the handle names it, so it is kept
    let _job = server
        .mock("GET", "/repos/acme/infra/actions/jobs/4")
        .with_status(200)
        .with_body(job_json(4, "e2e", "failure", "2024-05-01T10:06:00Z").to_string())
        .create_async()
        .await;
    let _jobs = server
        .mock("GET", "/repos/acme/infra/actions/runs/42/jobs")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({"total_count": 3, "jobs": [
                job_json(1, "build", "success", "2024-05-01T10:00:00Z"),
                job_json(2, "test", "failure", "2024-05-01T10:03:00Z"),
                job_json(4, "e2e", "failure", "2024-05-01T10:06:00Z")
            ]})
            .to_string(),
        )
        .create_async()
        .await;

    let job = client(&server)
        .locate(&run_ref(RunHandle::Job(4)))
        .await
        .unwrap();

    assert_eq!(job.id, 4);
    assert_eq!(job.name, "e2e");
    assert_eq!(job.ordinal, 2);
    assert_eq!(job.run_id, 42);
}

#[tokio::test]
async fn test_publish_finds_marker_on_later_comment_page() {
    let mut server = Server::new_async().await;
    let diagnosis = diagnosis(&server);
    let body = render_comment(&diagnosis, &server.url());

    let _run = server
        .mock("GET", "/repos/acme/infra/actions/runs/42")
        .with_status(200)
        .with_body(
            json!({"id": 42, "head_sha": "abc123", "pull_requests": [{"number": 12}]})
                .to_string(),
        )
        .create_async()
        .await;
    let chatter: Vec<_> = (0..100)
        .map(|i| json!({"id": i + 1, "body": format!("review comment {i}")}))
        .collect();
    let page_one = server
        .mock("GET", "/repos/acme/infra/issues/12/comments")
        .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
        .with_status(200)
        .with_body(serde_json::Value::from(chatter).to_string())
        .expect(1)
        .create_async()
        .await;
    let page_two = server
        .mock("GET", "/repos/acme/infra/issues/12/comments")
        .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
        .with_status(200)
        .with_body(json!([{"id": 700, "body": body}]).to_string())
        .expect(1)
        .create_async()
        .await;
    let create = server
        .mock("POST", "/repos/acme/infra/issues/12/comments")
        .expect(0)
        .create_async()
        .await;

    let result = client(&server)
        .publish_diagnosis(&run_ref(RunHandle::Run(42)), &diagnosis, false)
        .await
        .unwrap();

    page_one.assert_async().await;
    page_two.assert_async().await;
    create.assert_async().await;
    assert_eq!(result.action, PublishAction::Unchanged);
    assert_eq!(result.comment_id, Some(700));
}

#[tokio::test]
async fn test_repository_context_reads_matching_files() {
    let mut server = Server::new_async().await;
    let listing = server
        .mock("GET", "/repos/acme/infra/contents")
        .match_query(Matcher::UrlEncoded("ref".into(), "feature/vpc".into()))
        .with_status(200)
        .with_body(
            json!([
                {"name": "README.md", "path": "README.md", "type": "file", "size": 40},
                {"name": "main.tf", "path": "main.tf", "type": "file", "size": 30},
                {"name": "modules", "path": "modules", "type": "dir", "size": 0},
                {"name": "prod.tfvars", "path": "prod.tfvars", "type": "file", "size": 5000}
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let main_tf = server
        .mock("GET", "/repos/acme/infra/contents/main.tf")
        .match_query(Matcher::UrlEncoded("ref".into(), "feature/vpc".into()))
        .match_header("accept", "application/vnd.github.raw+json")
        .with_status(200)
        .with_body("provider \"aws\" {}\n")
        .expect(1)
        .create_async()
        .await;
    let readme = server
        .mock("GET", "/repos/acme/infra/contents/README.md")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let extensions = vec![".tf".to_string(), ".tfvars".to_string()];
    let context = client(&server)
        .fetch_repository_context("feature/vpc", &extensions, 1_000)
        .await
        .unwrap();

    listing.assert_async().await;
    main_tf.assert_async().await;
    readme.assert_async().await;
    assert_eq!(context.git_ref, "feature/vpc");
    assert_eq!(context.files.len(), 1);
    assert_eq!(context.files[0].path, "main.tf");
    assert_eq!(context.files[0].text, "provider \"aws\" {}\n");
    assert_eq!(context.skipped, vec!["prod.tfvars"]);
}
