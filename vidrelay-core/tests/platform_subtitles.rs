use std::time::Duration;

use vidrelay_core::chain::Task;
use vidrelay_core::handlers::PlatformSubtitleTask;
use vidrelay_core::{srt, ExecutionContext, ProcessingState, VideoRecord};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VIDEO_ID: &str = "dQw4w9WgXcQ";

async fn mount_captions(server: &MockServer) {
    let page = format!(
        r#"<html><script>var ytInitialPlayerResponse = {{"captions":{{"playerCaptionsTracklistRenderer":{{"captionTracks":[{{"baseUrl":"{}/api/timedtext?v={VIDEO_ID}&lang=en&fmt=srv1"}}]}}}}}};</script></html>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/watch"))
        .and(query_param("v", VIDEO_ID))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/timedtext"))
        .and(query_param("lang", "en"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0" encoding="utf-8" ?><transcript><text start="0" dur="1.5">Never gonna</text><text start="1.5" dur="2.25">give you up &amp;amp; run</text></transcript>"#,
        ))
        .mount(server)
        .await;
}

fn context(root: &std::path::Path) -> ExecutionContext {
    ExecutionContext::new(ProcessingState::new(root, VIDEO_ID), VideoRecord::new(VIDEO_ID))
}

#[tokio::test]
async fn captions_become_json_and_srt() {
    let server = MockServer::start().await;
    mount_captions(&server).await;
    let root = tempfile::tempdir().unwrap();
    let task = PlatformSubtitleTask::new(None, Duration::from_secs(5)).with_base_url(server.uri());
    let mut ctx = context(root.path());

    assert!(task.execute(&mut ctx).await, "{:?}", ctx.error);
    let cues = srt::read_file(&ctx.state.original_srt).await.unwrap();
    assert_eq!(cues.len(), 2);
    assert_eq!(cues[1].text, "give you up & run");
    assert_eq!(cues[1].start_ms, 1500);
    assert_eq!(cues[1].end_ms, 3750);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&ctx.state.original_json).unwrap()).unwrap();
    assert_eq!(json["transcript"][0]["content"], "Never gonna");
    assert_eq!(ctx.subtitle_path.as_deref(), Some(ctx.state.original_srt.as_path()));
}

#[tokio::test]
async fn dead_proxy_falls_back_to_direct() {
    let server = MockServer::start().await;
    mount_captions(&server).await;
    let root = tempfile::tempdir().unwrap();
    let task = PlatformSubtitleTask::new(Some("http://127.0.0.1:9".into()), Duration::from_secs(5))
        .with_base_url(server.uri());
    let mut ctx = context(root.path());
    assert!(task.execute(&mut ctx).await, "{:?}", ctx.error);
    assert!(ctx.state.original_srt.is_file());
}

#[tokio::test]
async fn page_without_tracks_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/watch"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>no captions</html>"))
        .mount(&server)
        .await;
    let root = tempfile::tempdir().unwrap();
    let task = PlatformSubtitleTask::new(None, Duration::from_secs(5)).with_base_url(server.uri());
    let mut ctx = context(root.path());
    assert!(!task.execute(&mut ctx).await);
    assert!(ctx.error.unwrap().contains("no caption track"));
    assert!(!ctx.state.original_srt.exists());
}
