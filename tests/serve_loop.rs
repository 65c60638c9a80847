mod common;

use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncRead;

use common::{RecordingWallpaper, Workspace};
use flux_plugin_daemon::router::serve;
use flux_plugin_daemon::transport::PipeTransport;

fn plugin(ws: &Workspace) -> flux_plugin_daemon::plugin::Plugin {
    ws.write_config(json!({}));
    ws.plugin(Arc::new(RecordingWallpaper::default()))
}

fn written<R: AsyncRead + Unpin>(transport: &PipeTransport<R, Vec<u8>>) -> String {
    String::from_utf8(transport.writer().clone()).unwrap()
}

#[tokio::test]
async fn answers_each_frame_until_shutdown() {
    let ws = Workspace::new();
    let plugin = plugin(&ws);

    let reader = tokio_test::io::Builder::new()
        .read(br#"{"tool_calls":[{"func":"render_video","params":{}}]}"#)
        .read(br#"{"messages":[{"role":"user","content":"hi"}]}"#)
        .read(b"this is not json")
        .read(br#"{"tool_calls":[{"func":"shutdown"}]}"#)
        .build();
    let mut transport = PipeTransport::new(reader, Vec::new());

    serve(&plugin, &mut transport).await;

    assert_eq!(
        written(&transport),
        concat!(
            r#"{"success":false,"message":"Plugin Error! Unknown command: render_video"}<<END>>"#,
            r#"{"success":false,"message":"Plugin Error! Malformed input."}<<END>>"#,
            r#"{"success":true,"message":"shutdown success."}<<END>>"#,
        )
    );
}

#[tokio::test]
async fn only_the_last_response_of_a_frame_is_sent() {
    let ws = Workspace::new();
    let plugin = plugin(&ws);

    let frame = br#"{"tool_calls":[{"func":"initialize"},{"func":"bogus"}]}"#;
    let mut transport = PipeTransport::new(&frame[..], Vec::new());

    // Ends at EOF
    serve(&plugin, &mut transport).await;

    assert_eq!(
        written(&transport),
        r#"{"success":false,"message":"Plugin Error! Unknown command: bogus"}<<END>>"#
    );
    // initialize still ran and created the output directory
    assert!(ws.output.is_dir());
}

#[tokio::test]
async fn shutdown_followed_by_other_calls_keeps_serving() {
    let ws = Workspace::new();
    let plugin = plugin(&ws);

    let reader = tokio_test::io::Builder::new()
        .read(br#"{"tool_calls":[{"func":"shutdown"},{"func":"initialize"}]}"#)
        .read(br#"{"tool_calls":[{"func":"shutdown"}]}"#)
        .build();
    let mut transport = PipeTransport::new(reader, Vec::new());

    serve(&plugin, &mut transport).await;

    assert_eq!(
        written(&transport),
        concat!(
            r#"{"success":true,"message":"initialize success."}<<END>>"#,
            r#"{"success":true,"message":"shutdown success."}<<END>>"#,
        )
    );
}

#[tokio::test]
async fn frames_larger_than_one_chunk_are_reassembled() {
    let ws = Workspace::new();
    let plugin = plugin(&ws);

    let padding = "x".repeat(6000);
    let frame = json!({
        "messages": [{ "role": "user", "content": padding }],
        "tool_calls": [{ "func": "shutdown" }]
    })
    .to_string();
    let bytes = frame.as_bytes();
    let reader = tokio_test::io::Builder::new()
        .read(&bytes[..4096])
        .read(&bytes[4096..])
        .build();
    let mut transport = PipeTransport::new(reader, Vec::new());

    serve(&plugin, &mut transport).await;

    assert_eq!(
        written(&transport),
        r#"{"success":true,"message":"shutdown success."}<<END>>"#
    );
}
