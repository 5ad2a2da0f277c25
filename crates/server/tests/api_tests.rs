use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use docflow_core::{RunStatus, StageName};
use orchestrator::{
    GenerationRequest, Orchestrator, OrchestratorConfig, RetryPolicy, ScriptedGenerationClient,
    ScriptedReply,
};
use sandbox::{SandboxLimits, SandboxSettings};
use serde_json::Value;
use server::{create_router, state::AppState};
use tempfile::TempDir;
use uuid::Uuid;

const ANNUAL_REPORT: &str = "ACME Corp FY2024. Revenue 1,250,000 USD. Net income 210,000 USD.";

const EXTRACTION: &str = r#"{
  "data_points": [
    {"field_name": "revenue", "value": "1250000", "unit": "USD", "period": "FY2024", "confidence": 0.95},
    {"field_name": "net income", "value": "210000", "unit": "USD", "confidence": 0.9}
  ],
  "confidence": 0.9
}"#;

fn requested_report(request: &GenerationRequest) -> String {
    let marker = "Save the report as `";
    let start = request.prompt.find(marker).unwrap() + marker.len();
    let rest = &request.prompt[start..];
    rest[..rest.find('`').unwrap()].to_string()
}

fn scripted_client() -> ScriptedGenerationClient {
    ScriptedGenerationClient::new()
        .with_text(StageName::DataExtractor, EXTRACTION)
        .with_reply(
            StageName::CodeGenerator,
            ScriptedReply::generate(|request| {
                format!(
                    "```sh\ncat arranged_data.json > {}\n```",
                    requested_report(request)
                )
            }),
        )
}

struct Harness {
    server: TestServer,
    orchestrator: Orchestrator,
    _root: TempDir,
}

fn setup_with(client: ScriptedGenerationClient) -> Harness {
    let root = TempDir::new().unwrap();
    let config = OrchestratorConfig::default()
        .with_retry(
            RetryPolicy::new(2).with_backoff(Duration::from_millis(10), Duration::from_millis(20)),
        )
        .with_stage_timeout(Duration::from_secs(30))
        .with_limits(SandboxLimits::default().unconfined())
        .with_sandbox(SandboxSettings::new(root.path()));
    let orchestrator = Orchestrator::builder(config)
        .with_client(Arc::new(client))
        .build()
        .unwrap();
    let state = AppState::new(orchestrator.clone()).with_keep_alive(Duration::from_secs(1));
    let server = TestServer::new(create_router(state)).unwrap();
    Harness {
        server,
        orchestrator,
        _root: root,
    }
}

fn setup() -> Harness {
    setup_with(scripted_client())
}

async fn submit(harness: &Harness) -> Uuid {
    let response = harness
        .server
        .post("/api/runs")
        .add_query_param("name", "acme.txt")
        .add_query_param("analysis_type", "financial-summary")
        .text(ANNUAL_REPORT)
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    body["run_id"].as_str().unwrap().parse().unwrap()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let harness = setup();
        let response = harness.server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_runs() {
        let harness = setup();
        let response = harness.server.get("/api/openapi.json").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["paths"]["/api/runs"].is_object());
        assert!(body["paths"]["/api/runs/{id}/events"].is_object());
        assert!(body["paths"]["/api/runs/{id}"]["delete"].is_object());
    }
}

mod runs {
    use super::*;

    #[tokio::test]
    async fn test_submit_and_fetch_result() {
        let harness = setup();
        let run_id = submit(&harness).await;

        let ctx = harness.orchestrator.wait(run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Completed);

        let response = harness.server.get(&format!("/api/runs/{}/result", run_id)).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["id"], run_id.to_string());
        assert_eq!(body["document"]["name"], "acme.txt");
        assert_eq!(body["stage_results"].as_array().unwrap().len(), 5);
        assert!(body["failure"].is_null());

        let list = harness.server.get("/api/runs").await;
        list.assert_status_ok();
        let runs: Value = list.json();
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "completed");
        assert_eq!(runs[0]["document"], "acme.txt");
    }

    #[tokio::test]
    async fn test_report_and_produced_file() {
        let harness = setup();
        let run_id = submit(&harness).await;
        let ctx = harness.orchestrator.wait(run_id).await.unwrap();
        let report_name = ctx.artifact.as_ref().unwrap().expected_outputs[0].clone();

        let report = harness.server.get(&format!("/api/runs/{}/report", run_id)).await;
        report.assert_status_ok();
        let text = report.text();
        assert!(text.contains("| Stage | Status | Attempts | Duration | Note |"));
        assert!(text.contains(&report_name));

        let file = harness
            .server
            .get(&format!("/api/runs/{}/files/{}", run_id, report_name))
            .await;
        file.assert_status_ok();
        let contents: Value = serde_json::from_slice(file.as_bytes()).unwrap();
        assert!(contents["categories"].is_array());

        harness
            .server
            .get(&format!("/api/runs/{}/files/missing.xlsx", run_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_file_in_subdirectory() {
        let client = ScriptedGenerationClient::new()
            .with_text(StageName::DataExtractor, EXTRACTION)
            .with_reply(
                StageName::CodeGenerator,
                ScriptedReply::generate(|request| {
                    format!(
                        "```sh\ncat arranged_data.json > {}\nmkdir -p charts/q4\nprintf 'a,b\\n1,2\\n' > charts/q4/revenue.csv\n```",
                        requested_report(request)
                    )
                }),
            );
        let harness = setup_with(client);
        let run_id = submit(&harness).await;
        let ctx = harness.orchestrator.wait(run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Completed, "failure: {:?}", ctx.failure);

        let file = harness
            .server
            .get(&format!("/api/runs/{}/files/charts/q4/revenue.csv", run_id))
            .await;
        file.assert_status_ok();
        assert_eq!(file.text(), "a,b\n1,2\n");

        harness
            .server
            .get(&format!("/api/runs/{}/files/charts/missing.csv", run_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_finished_run() {
        let harness = setup();
        let run_id = submit(&harness).await;
        harness.orchestrator.wait(run_id).await.unwrap();

        harness
            .server
            .delete(&format!("/api/runs/{}", run_id))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        harness
            .server
            .get(&format!("/api/runs/{}", run_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        harness
            .server
            .get(&format!("/api/runs/{}/events", run_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        harness
            .server
            .delete(&format!("/api/runs/{}", run_id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        assert!(harness.orchestrator.runs().is_empty());
    }

    #[tokio::test]
    async fn test_delete_live_run_conflicts() {
        let client = ScriptedGenerationClient::new()
            .with_reply(StageName::DataExtractor, ScriptedReply::Hang);
        let harness = setup_with(client);
        let run_id = submit(&harness).await;

        let response = harness.server.delete(&format!("/api/runs/{}", run_id)).await;
        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "not_terminal");
        assert!(harness.orchestrator.snapshot(run_id).is_ok());

        harness.orchestrator.cancel(run_id, "test").unwrap();
        harness.orchestrator.wait(run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_unavailable() {
        let harness = setup();
        harness.orchestrator.shutdown();

        let response = harness
            .server
            .post("/api/runs")
            .add_query_param("name", "acme.txt")
            .add_query_param("analysis_type", "financial-summary")
            .text(ANNUAL_REPORT)
            .await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["error"], "unavailable");
    }

    #[tokio::test]
    async fn test_unsupported_format_is_rejected() {
        let harness = setup();
        let response = harness
            .server
            .post("/api/runs")
            .add_query_param("name", "payload.exe")
            .add_query_param("analysis_type", "financial-summary")
            .bytes(vec![0x4d, 0x5a].into())
            .await;

        response.assert_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let body: Value = response.json();
        assert_eq!(body["error"], "unsupported_format");
        assert!(harness.orchestrator.runs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_name_and_format() {
        let harness = setup();
        let response = harness
            .server
            .post("/api/runs")
            .add_query_param("prompt", "summarize")
            .text(ANNUAL_REPORT)
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let harness = setup();
        let id = Uuid::new_v4();

        for path in ["", "/result", "/report", "/events"] {
            let response = harness.server.get(&format!("/api/runs/{}{}", id, path)).await;
            response.assert_status(StatusCode::NOT_FOUND);
        }
        harness
            .server
            .post(&format!("/api/runs/{}/cancel", id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_result_conflicts_while_running_then_cancel() {
        let client = ScriptedGenerationClient::new()
            .with_reply(StageName::DataExtractor, ScriptedReply::Hang);
        let harness = setup_with(client);
        let run_id = submit(&harness).await;

        let response = harness.server.get(&format!("/api/runs/{}/result", run_id)).await;
        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "not_terminal");

        let cancel = harness
            .server
            .post(&format!("/api/runs/{}/cancel", run_id))
            .add_query_param("reason", "operator")
            .await;
        cancel.assert_status_ok();
        let body: Value = cancel.json();
        assert_eq!(body["cancelled"], true);

        let ctx = harness.orchestrator.wait(run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Cancelled);
        assert_eq!(ctx.cancel_reason.as_deref(), Some("operator"));

        let again = harness
            .server
            .post(&format!("/api/runs/{}/cancel", run_id))
            .await;
        let body: Value = again.json();
        assert_eq!(body["cancelled"], false);
    }
}

mod event_stream {
    use super::*;

    /// Values of one SSE field, in stream order.
    fn field<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
        let prefix = format!("{}:", name);
        text.lines()
            .filter_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::trim)
            .collect()
    }

    #[tokio::test]
    async fn test_event_stream_replays_and_ends() {
        let harness = setup();
        let run_id = submit(&harness).await;
        harness.orchestrator.wait(run_id).await.unwrap();

        let response = harness.server.get(&format!("/api/runs/{}/events", run_id)).await;
        response.assert_status_ok();
        let text = response.text();

        let names = field(&text, "event");
        assert_eq!(names.first(), Some(&"run.started"));
        assert_eq!(names.last(), Some(&"run.terminal"));
        assert!(names.contains(&"data_extractor.completed"));
        assert!(names.contains(&"sandbox.completed"));

        let ids: Vec<u64> = field(&text, "id").iter().map(|id| id.parse().unwrap()).collect();
        let expected: Vec<u64> = (1..=ids.len() as u64).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_last_event_id_skips_seen_events() {
        let harness = setup();
        let run_id = submit(&harness).await;
        harness.orchestrator.wait(run_id).await.unwrap();
        let total = harness.orchestrator.bus().last_sequence(run_id).unwrap();

        let response = harness
            .server
            .get(&format!("/api/runs/{}/events", run_id))
            .add_header(
                HeaderName::from_static("last-event-id"),
                HeaderValue::from_str(&(total - 1).to_string()).unwrap(),
            )
            .await;
        let text = response.text();

        assert_eq!(field(&text, "id"), vec![total.to_string()]);
        assert_eq!(field(&text, "event"), vec!["run.terminal"]);
    }
}
