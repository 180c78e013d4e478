//! Every protocol violation closes the connection with a specific code and reason.
mod common;

use common::*;
use wsengine::{CloseCode, Frame, OpCode, Options};

/// Sends `frames` and expects the server to fail the connection with `code` and `reason`.
async fn expect_failure(
    extensions: Option<&str>,
    options: Options,
    frames: Vec<Frame>,
    code: CloseCode,
    reason: &str,
) {
    let (registry, mut events) = echo_registry(None);
    let (mut client, handle) = connect_with(&registry, PATH, extensions, options);
    let id = handle.connection().id();
    next_event(&mut events).await;

    client.send_all(frames).await.unwrap();
    client.expect_close_with(code, reason).await;

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(id, code)
    );
    assert_eq!(handle.await, Some(code));
    assert_eq!(registry.connection_count(), 0);
}

async fn expect_protocol_error(frames: Vec<Frame>, reason: &str) {
    expect_failure(None, Options::default(), frames, CloseCode::Protocol, reason).await;
}

#[tokio::test]
async fn test_binary_frame_inside_message() {
    expect_protocol_error(
        vec![
            Frame::new(false, OpCode::Text, "Testing, "),
            Frame::binary("testing"),
        ],
        "A binary frame must be the first in the message",
    )
    .await;

    expect_protocol_error(
        vec![
            Frame::new(false, OpCode::Binary, "Testing, "),
            Frame::binary("testing"),
        ],
        "A binary frame must be the first in the message",
    )
    .await;
}

#[tokio::test]
async fn test_text_frame_inside_message() {
    expect_protocol_error(
        vec![
            Frame::new(false, OpCode::Binary, &[1u8, 2, 3][..]),
            Frame::text("Testing"),
        ],
        "A text frame must be the first in the message",
    )
    .await;

    expect_protocol_error(
        vec![
            Frame::new(false, OpCode::Text, "Testing, "),
            Frame::text("testing"),
        ],
        "A text frame must be the first in the message",
    )
    .await;
}

#[tokio::test]
async fn test_continuation_without_start() {
    expect_protocol_error(
        vec![Frame::continuation(true, "Testing")],
        "Continuation sent with prior binary or text frame",
    )
    .await;
}

#[tokio::test]
async fn test_reserved_opcodes() {
    for opcode in [3u8, 7, 0xB, 0xF] {
        expect_protocol_error(
            vec![Frame::new(true, OpCode::from(opcode), "x")],
            &format!("Parsed a frame with an invalid operation code of {opcode}"),
        )
        .await;
    }
}

#[tokio::test]
async fn test_unmasked_frame() {
    let (registry, _events) = echo_registry(None);
    let (mut client, handle) = connect(&registry, PATH, None);

    client
        .send_unmasked(vec![Frame::text("Testing")])
        .await
        .unwrap();
    client
        .expect_close_with(
            CloseCode::Protocol,
            "Received a frame from a client that wasn't masked",
        )
        .await;
    assert_eq!(handle.await, Some(CloseCode::Protocol));
}

#[tokio::test]
async fn test_control_frame_too_large() {
    expect_protocol_error(
        vec![Frame::ping(&[b'x'; 126][..])],
        "Control frames are only allowed to have payload up to and including 125 octets",
    )
    .await;
}

#[tokio::test]
async fn test_fragmented_control_frame() {
    expect_protocol_error(
        vec![Frame::new(false, OpCode::Ping, "Testing")],
        "Control frames must not be fragmented",
    )
    .await;
}

#[tokio::test]
async fn test_rsv1_without_compression() {
    expect_protocol_error(
        vec![Frame::text("Testing").compressed()],
        "RSV1 must be 0 unless negotiated to define meaning for non-zero values",
    )
    .await;
}

#[tokio::test]
async fn test_rsv1_on_control_frame() {
    expect_failure(
        Some("permessage-deflate"),
        Options::default(),
        vec![Frame::ping("Testing").compressed()],
        CloseCode::Protocol,
        "RSV1 must be 0 unless negotiated to define meaning for non-zero values",
    )
    .await;
}

#[tokio::test]
async fn test_rsv1_on_continuation_frame() {
    let (registry, _events) = echo_registry(None);
    let (mut client, handle) = connect(&registry, PATH, Some("permessage-deflate"));

    let (first, second) = client.fragments(OpCode::Text, b"Testing, testing 1,2,3");
    client
        .send_all(vec![first, second.compressed()])
        .await
        .unwrap();
    client
        .expect_close_with(
            CloseCode::Protocol,
            "RSV1 must be 0 unless negotiated to define meaning for non-zero values",
        )
        .await;
    assert_eq!(handle.await, Some(CloseCode::Protocol));
}

#[tokio::test]
async fn test_rsv2_and_rsv3() {
    let mut rsv2 = Frame::text("Testing");
    rsv2.rsv2 = true;
    expect_protocol_error(
        vec![rsv2],
        "RSV2 and RSV3 must be 0 unless negotiated to define meaning for non-zero values",
    )
    .await;

    let mut rsv3 = Frame::binary("Testing");
    rsv3.rsv3 = true;
    expect_protocol_error(
        vec![rsv3],
        "RSV2 and RSV3 must be 0 unless negotiated to define meaning for non-zero values",
    )
    .await;
}

#[tokio::test]
async fn test_close_payload_one_byte() {
    expect_protocol_error(
        vec![Frame::close_raw([0x03u8])],
        "Close frame payload must be empty or at least 2 bytes long",
    )
    .await;
}

#[tokio::test]
async fn test_illegal_close_codes() {
    // answered with a bare 1002 and no reason
    for code in [0u16, 999, 1004, 1005, 1006, 1015, 2999, 5000, 65535] {
        expect_protocol_error(vec![Frame::close(CloseCode::from(code), "")], "").await;
    }
}

#[tokio::test]
async fn test_close_reason_not_utf8() {
    expect_failure(
        None,
        Options::default(),
        vec![Frame::close_raw([0x03u8, 0xE8, 0xC3, 0x28])],
        CloseCode::Invalid,
        "Failed to convert received close message to UTF-8 String",
    )
    .await;
}

#[tokio::test]
async fn test_text_not_utf8() {
    expect_failure(
        None,
        Options::default(),
        vec![Frame::text(&[b'a', 0xC3, 0x28][..])],
        CloseCode::Invalid,
        "Failed to convert received payload to UTF-8 String",
    )
    .await;

    // the check runs on the whole message, not per fragment
    expect_failure(
        None,
        Options::default(),
        vec![
            Frame::new(false, OpCode::Text, "valid"),
            Frame::continuation(true, &[0xFFu8][..]),
        ],
        CloseCode::Invalid,
        "Failed to convert received payload to UTF-8 String",
    )
    .await;
}

#[tokio::test]
async fn test_corrupt_compressed_payload() {
    expect_failure(
        Some("permessage-deflate"),
        Options::default(),
        // BTYPE 11 is a reserved block type
        vec![Frame::text(&[0xFFu8; 8][..]).compressed()],
        CloseCode::Invalid,
        "Failed to decompress received payload",
    )
    .await;
}

#[tokio::test]
async fn test_frame_too_large() {
    expect_failure(
        None,
        Options::default().with_max_payload_read(1024),
        vec![Frame::binary(&[0u8; 2000][..])],
        CloseCode::Size,
        "Frame payload exceeds the maximum allowed size",
    )
    .await;
}

#[tokio::test]
async fn test_message_too_large() {
    expect_failure(
        None,
        Options::default().with_max_message_size(1000),
        vec![
            Frame::new(false, OpCode::Binary, &[0u8; 600][..]),
            Frame::continuation(true, &[0u8; 600][..]),
        ],
        CloseCode::Size,
        "Message exceeds the maximum allowed size",
    )
    .await;
}

#[tokio::test]
async fn test_inflated_message_too_large() {
    let (registry, _events) = echo_registry(None);
    let options = Options::default().with_max_message_size(10_000);
    let (mut client, handle) =
        connect_with(&registry, PATH, Some("permessage-deflate"), options);

    // compresses far below the limit, inflates far above it
    let frame = client.message(OpCode::Text, &[b'a'; 50_000]);
    assert!(frame.payload.len() < 10_000);
    client.send(frame).await.unwrap();

    client
        .expect_close_with(CloseCode::Size, "Message exceeds the maximum allowed size")
        .await;
    assert_eq!(handle.await, Some(CloseCode::Size));
}

#[tokio::test]
async fn test_frames_after_violation_are_ignored() {
    let (registry, mut events) = echo_registry(None);
    let (mut client, handle) = connect(&registry, PATH, None);
    next_event(&mut events).await;

    client
        .send_all(vec![
            Frame::continuation(true, "orphan"),
            Frame::text("never delivered"),
        ])
        .await
        .unwrap();
    client
        .expect_close_with(
            CloseCode::Protocol,
            "Continuation sent with prior binary or text frame",
        )
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        Event::Disconnected(_, CloseCode::Protocol)
    ));
    assert_eq!(handle.await, Some(CloseCode::Protocol));
    assert!(events.try_recv().is_err());
}
