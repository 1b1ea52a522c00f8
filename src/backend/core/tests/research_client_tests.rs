//! `HttpResearchClient` against a mock research service.

use research_queue_core::config::ResearchConfig;
use research_queue_core::jobs::{ResearchPayload, ResearchRequest};
use research_queue_core::research::{FailureKind, HttpResearchClient, ResearchClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, api_key: Option<&str>) -> HttpResearchClient {
    let config = ResearchConfig {
        endpoint: format!("{}/api/v1/research", server.uri()),
        api_key: api_key.map(str::to_string),
        ..Default::default()
    };
    HttpResearchClient::new(&config).unwrap()
}

fn payload() -> ResearchPayload {
    ResearchRequest::new("quantum computing trends")
        .with_output_format("markdown")
        .with_source_limit(5)
        .with_focus_area("technical")
        .validate(1000)
        .unwrap()
}

#[tokio::test]
async fn test_successful_request_returns_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/research"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "query": "quantum computing trends",
            "output_format": "markdown",
            "max_sources": 5,
            "focus_area": "technical"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "report": "Qubits are getting better",
            "sources": ["https://example.org/qubits"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let report = client(&server, Some("secret"))
        .perform(&payload(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(report.report, "Qubits are getting better");
    assert_eq!(report.sources, vec!["https://example.org/qubits".to_string()]);
}

#[tokio::test]
async fn test_error_status_is_rejected_with_snippet() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let failure = client(&server, None)
        .perform(&payload(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Rejected);
    assert!(failure.message.contains("502"));
    assert!(failure.message.contains("bad gateway"));
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"report": "late"}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let failure = client(&server, None)
        .perform(&payload(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(failure.is_timeout());
    assert_eq!(failure.to_string(), "timeout");
}

#[tokio::test]
async fn test_unreadable_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let failure = client(&server, None)
        .perform(&payload(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::InvalidResponse);
}
