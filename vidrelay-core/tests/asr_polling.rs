use serde_json::json;
use vidrelay_core::asr::AsrError;
use vidrelay_core::config::TranscriptionSection;
use vidrelay_core::BcutClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer) -> TranscriptionSection {
    TranscriptionSection {
        base_url: server.uri(),
        poll_interval_ms: 1,
        max_polls: 10,
        ..TranscriptionSection::default()
    }
}

fn status_body(status: i64) -> serde_json::Value {
    json!({ "code": 0, "message": "", "data": { "status": status } })
}

async fn result_queries(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/task/result")
        .count()
}

async fn mount_upload_flow(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/resource/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": {
                "upload_id": "up-1",
                "in_boss_key": "boss-1",
                "per_size": 4,
                "upload_urls": [
                    format!("{}/part/1", server.uri()),
                    format!("{}/part/2", server.uri()),
                ],
            }
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/part/1"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/part/2"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-2\""))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/resource/create/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": null })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/task"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "code": 0, "data": { "task_id": "task-9" } })),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn five_running_polls_then_success_is_six_queries() {
    let server = MockServer::start().await;
    mount_upload_flow(&server).await;
    Mock::given(method("GET"))
        .and(path("/task/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body(1)))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    let recognition = json!({
        "language": "en",
        "utterances": [
            { "transcript": "hello", "start_time": 0, "end_time": 1500 },
            { "transcript": "world", "start_time": 1500, "end_time": 3000 },
        ]
    })
    .to_string();
    Mock::given(method("GET"))
        .and(path("/task/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "status": 2, "result": recognition }
        })))
        .mount(&server)
        .await;

    let client = BcutClient::new(&settings(&server)).unwrap();
    let cues = client.transcribe(b"0123456789").await.unwrap();

    assert_eq!(cues.len(), 2);
    assert_eq!(cues[0].text, "hello");
    assert_eq!(cues[1].end_ms, 3000);
    assert_eq!(result_queries(&server).await, 6);

    let parts: Vec<usize> = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().starts_with("/part/"))
        .map(|request| request.body.len())
        .collect();
    assert_eq!(parts, vec![4, 4]);
}

#[tokio::test]
async fn failed_task_stops_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/task/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "status": 3, "error_code": "E_AUDIO" }
        })))
        .mount(&server)
        .await;

    let client = BcutClient::new(&settings(&server)).unwrap();
    let err = client.poll_result("task-9").await.unwrap_err();
    match err {
        AsrError::TaskFailed { error_code } => assert_eq!(error_code, "E_AUDIO"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(result_queries(&server).await, 1);
}

#[tokio::test]
async fn exhausted_polls_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/task/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body(0)))
        .mount(&server)
        .await;

    let client = BcutClient::new(&TranscriptionSection {
        max_polls: 3,
        ..settings(&server)
    })
    .unwrap();
    assert!(matches!(
        client.poll_result("task-9").await,
        Err(AsrError::Timeout { polls: 3 })
    ));
    assert_eq!(result_queries(&server).await, 3);
}

#[tokio::test]
async fn failing_part_aborts_upload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/part/1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = BcutClient::new(&settings(&server)).unwrap();
    let ticket = vidrelay_core::asr::UploadTicket {
        upload_id: "up".into(),
        in_boss_key: "boss".into(),
        per_size: 2,
        upload_urls: vec![
            format!("{}/part/1", server.uri()),
            format!("{}/part/2", server.uri()),
        ],
    };
    let err = client.upload_parts(&ticket, b"abcd").await.unwrap_err();
    assert!(matches!(err, AsrError::PartStatus { part: 1, status: 500 }));
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
}
