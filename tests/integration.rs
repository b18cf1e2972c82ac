//! End-to-end tests driving client and server connections over an
//! in-process duplex transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use wiremux::codec::MsgPackCodec;
use wiremux::protocol::{FrameBuffer, FrameKind, HEADER_SIZE};
use wiremux::{
    CallOptions, Connection, ConnectionOptions, HandlerResult, MethodType, Requests, Responder,
    ServerCall, ServiceBuilder, ServiceRegistry, StatusCode, WiremuxError,
};

/// Honors `RUST_LOG` when debugging a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A connected client/server pair over an in-process duplex transport.
fn pair(services: ServiceRegistry) -> (Connection, Connection) {
    init_tracing();
    let (a, b) = tokio::io::duplex(256 * 1024);
    let client = Connection::client(a, ConnectionOptions::default());
    let server = Connection::server(b, services, ConnectionOptions::default());
    (client, server)
}

fn echo_services() -> ServiceRegistry {
    ServiceBuilder::new()
        .raw("/svc/echo", MethodType::Unary, |mut call: ServerCall| async move {
            let request = call.recv().await.expect("request message");
            call.send_last(request).await
        })
        .build()
}

#[tokio::test]
async fn unary_echo_round_trips_payload_bytes() {
    let (client_conn, _server_conn) = pair(echo_services());
    let client = client_conn.client_handle();

    let reply = client
        .unary("/svc/echo", Bytes::from_static(b"hello, world!"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hello, world!");

    // The table must not leak completed calls.
    assert_eq!(client_conn.active_streams(), 0);
}

#[tokio::test]
async fn unary_echo_client_wire_bytes_are_exact() {
    let (transport, mut peer) = tokio::io::duplex(64 * 1024);
    let client_conn = Connection::client(transport, ConnectionOptions::default());
    let client = client_conn.client_handle();

    let call = client
        .start_unary(
            "/svc/echo",
            Bytes::from_static(b"hello, world!"),
            CallOptions::default(),
        )
        .await
        .unwrap();

    // NewStream: kind 1, flags 0, stream id 1, seq 0, len 9, "/svc/echo".
    let mut new_stream = [0u8; HEADER_SIZE + 9];
    peer.read_exact(&mut new_stream).await.unwrap();
    assert_eq!(
        &new_stream[..HEADER_SIZE],
        &[0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00]
    );
    assert_eq!(&new_stream[HEADER_SIZE..], b"/svc/echo");

    // Payload: kind 5, EndItem|EndAllItems, stream id 1, seq 0, len 13.
    let mut payload = [0u8; HEADER_SIZE + 13];
    peer.read_exact(&mut payload).await.unwrap();
    assert_eq!(
        &payload[..HEADER_SIZE],
        &[0x05, 0x03, 0x01, 0x00, 0x00, 0x00, 0x0D, 0x00]
    );
    assert_eq!(&payload[HEADER_SIZE..], b"hello, world!");

    drop(call);
}

#[tokio::test]
async fn client_streaming_sum() {
    const N: i64 = 10_000;

    let services = ServiceBuilder::new()
        .client_streaming("/svc/sum", |mut input: Requests<i64>, _ctx| async move {
            let mut total = 0i64;
            while let Some(n) = input.next().await? {
                total += n;
            }
            Ok(total)
        })
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let call = client.client_streaming("/svc/sum").await.unwrap();
    for i in 0..N {
        call.send_msgpack(&i).await.unwrap();
    }
    let response = call.finish().await.unwrap();
    let sum: i64 = MsgPackCodec::decode(&response).unwrap();

    assert_eq!(sum, 49_995_000);
}

#[tokio::test]
async fn server_streaming_count_down_in_order() {
    const COUNT: u32 = 100;

    let services = ServiceBuilder::new()
        .server_streaming(
            "/svc/count",
            |count: u32, out: Responder<u32>, _ctx| async move {
                for i in 0..count {
                    out.send(&i).await?;
                }
                Ok(())
            },
        )
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let request = Bytes::from(MsgPackCodec::encode(&COUNT).unwrap());
    let mut call = client.server_streaming("/svc/count", request).await.unwrap();

    let mut expected = 0u32;
    while let Some(value) = call.next_msgpack::<u32>().await.unwrap() {
        assert_eq!(value, expected);
        expected += 1;
    }
    assert_eq!(expected, COUNT);
}

#[tokio::test]
async fn duplex_echo_interleaves_reads_and_writes() {
    let services = ServiceBuilder::new()
        .duplex(
            "/svc/mirror",
            |mut input: Requests<u32>, out: Responder<u32>, _ctx| async move {
                while let Some(value) = input.next().await? {
                    out.send(&value).await?;
                }
                Ok(())
            },
        )
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let mut call = client.duplex("/svc/mirror").await.unwrap();
    for i in 0..10u32 {
        call.send(Bytes::from(MsgPackCodec::encode(&i).unwrap()))
            .await
            .unwrap();
        let echoed = call.next().await.unwrap().expect("echo for each write");
        let echoed: u32 = MsgPackCodec::decode(&echoed).unwrap();
        assert_eq!(echoed, i);
    }

    call.finish_sending().await.unwrap();
    assert!(call.next().await.unwrap().is_none());
}

#[tokio::test]
async fn cancellation_resolves_client_and_fires_server_signal() {
    let server_saw_cancel = Arc::new(AtomicBool::new(false));
    let flag = server_saw_cancel.clone();

    let services = ServiceBuilder::new()
        .raw("/svc/hang", MethodType::Unary, move |call: ServerCall| {
            let flag = flag.clone();
            async move {
                let mut cancellation = call.context().cancellation();
                tokio::spawn(async move {
                    loop {
                        if *cancellation.borrow() {
                            flag.store(true, Ordering::SeqCst);
                            return;
                        }
                        if cancellation.changed().await.is_err() {
                            return;
                        }
                    }
                });
                std::future::pending::<HandlerResult>().await
            }
        })
        .build();
    let (client_conn, server_conn) = pair(services);
    let client = client_conn.client_handle();

    let call = client
        .start_unary("/svc/hang", Bytes::from_static(b"x"), CallOptions::default())
        .await
        .unwrap();
    let cancel = call.cancel_handle();

    // Give the server a moment to accept the stream, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = call.response().await.unwrap_err();
    match err {
        WiremuxError::Rpc(status) => assert_eq!(status.code, StatusCode::Cancelled),
        other => panic!("expected cancelled status, got {other}"),
    }

    // The server-side cancellation signal must fire.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !server_saw_cancel.load(Ordering::SeqCst) {
        assert!(tokio::time::Instant::now() < deadline, "server never saw cancel");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server_conn.active_streams(), 0);
}

#[tokio::test]
async fn cancellation_emits_cancel_frame_on_the_wire() {
    let (transport, mut peer) = tokio::io::duplex(64 * 1024);
    let client_conn = Connection::client(transport, ConnectionOptions::default());
    let client = client_conn.client_handle();

    let call = client
        .start_unary("/svc/echo", Bytes::from_static(b"x"), CallOptions::default())
        .await
        .unwrap();

    // Drain NewStream + Payload.
    let mut buffer = FrameBuffer::new();
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 4096];
    while frames.len() < 2 {
        let n = peer.read(&mut buf).await.unwrap();
        frames.extend(buffer.push(&buf[..n]).unwrap());
    }
    let stream_id = frames[0].stream_id();

    call.cancel_handle().cancel();

    while frames.len() < 3 {
        let n = peer.read(&mut buf).await.unwrap();
        frames.extend(buffer.push(&buf[..n]).unwrap());
    }
    assert_eq!(frames[2].kind(), FrameKind::Cancel);
    assert_eq!(frames[2].stream_id(), stream_id);
}

#[tokio::test]
async fn method_not_found_resolves_unimplemented() {
    let (client_conn, _server_conn) = pair(ServiceBuilder::new().build());
    let client = client_conn.client_handle();

    let err = client
        .unary("/nope", Bytes::from_static(b"?"))
        .await
        .unwrap_err();
    match err {
        WiremuxError::Rpc(status) => {
            assert_eq!(status.code, StatusCode::Unimplemented);
            assert!(status.message.contains("/nope"));
        }
        other => panic!("expected unimplemented, got {other}"),
    }
}

#[tokio::test]
async fn deadline_exceeded_cancels_the_call() {
    let services = ServiceBuilder::new()
        .raw("/svc/hang", MethodType::Unary, |_call: ServerCall| async move {
            std::future::pending::<HandlerResult>().await
        })
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let err = client
        .unary_with(
            "/svc/hang",
            Bytes::from_static(b"x"),
            CallOptions::deadline(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    match err {
        WiremuxError::Rpc(status) => assert_eq!(status.code, StatusCode::DeadlineExceeded),
        other => panic!("expected deadline exceeded, got {other}"),
    }
}

#[tokio::test]
async fn oversized_message_survives_chunked_transfer() {
    let (client_conn, _server_conn) = pair(echo_services());
    let client = client_conn.client_handle();

    // Larger than one frame: split on the wire, reassembled on arrival.
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let reply = client
        .unary("/svc/echo", Bytes::from(big.clone()))
        .await
        .unwrap();

    assert_eq!(&reply[..], &big[..]);
}

#[tokio::test]
async fn empty_message_round_trips() {
    let (client_conn, _server_conn) = pair(echo_services());
    let client = client_conn.client_handle();

    let reply = client.unary("/svc/echo", Bytes::new()).await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test]
async fn handler_error_surfaces_as_status() {
    let services = ServiceBuilder::new()
        .unary("/svc/deny", |_request: String, _ctx| async move {
            Err::<String, _>(wiremux::Status::new(
                StatusCode::PermissionDenied,
                "not yours",
            ))
        })
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let err = client
        .unary_msgpack::<String, String>("/svc/deny", &"secret".to_string())
        .await
        .unwrap_err();
    match err {
        WiremuxError::Rpc(status) => {
            assert_eq!(status.code, StatusCode::PermissionDenied);
            assert_eq!(status.message, "not yours");
        }
        other => panic!("expected status error, got {other}"),
    }
}

#[tokio::test]
async fn handler_panic_becomes_unknown_status_and_connection_survives() {
    let services = ServiceBuilder::new()
        .unary("/svc/boom", |request: String, _ctx| async move {
            if !request.is_empty() {
                panic!("kaboom");
            }
            Ok(request)
        })
        .unary("/svc/ok", |text: String, _ctx| async move { Ok(text) })
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let err = client
        .unary_msgpack::<String, String>("/svc/boom", &"x".to_string())
        .await
        .unwrap_err();
    match err {
        WiremuxError::Rpc(status) => {
            assert_eq!(status.code, StatusCode::Unknown);
            assert!(status.message.contains("kaboom"));
        }
        other => panic!("expected unknown status, got {other}"),
    }

    // A per-stream failure never terminates the connection.
    let reply: String = client
        .unary_msgpack("/svc/ok", &"still here".to_string())
        .await
        .unwrap();
    assert_eq!(reply, "still here");
}

#[tokio::test]
async fn concurrent_calls_multiplex_on_one_connection() {
    let services = ServiceBuilder::new()
        .unary("/svc/double", |n: u64, _ctx| async move { Ok(n * 2) })
        .build();
    let (client_conn, _server_conn) = pair(services);
    let client = client_conn.client_handle();

    let mut tasks = Vec::new();
    for i in 0..64u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let doubled: u64 = client.unary_msgpack("/svc/double", &i).await.unwrap();
            assert_eq!(doubled, i * 2);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(client_conn.active_streams(), 0);
}

#[tokio::test]
async fn graceful_close_tears_down_both_sides() {
    let (client_conn, server_conn) = pair(echo_services());

    client_conn.ping().await.unwrap();
    client_conn.close().await.unwrap();
    server_conn.closed().await;

    // Calls after close fail fast.
    let err = client_conn
        .client_handle()
        .unary("/svc/echo", Bytes::from_static(b"late"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WiremuxError::ConnectionClosed | WiremuxError::Rpc(_) | WiremuxError::BackpressureTimeout
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn unary_echo_over_local_pipe_transport() {
    use wiremux::transport::{self, PipeListener};

    let path = transport::pipe_path("echo-test");
    let listener = PipeListener::bind(&path).await.unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let client_side = transport::connect(&path).await.unwrap();
    let server_side = accept.await.unwrap();

    let _server = Connection::server(server_side, echo_services(), ConnectionOptions::default());
    let client_conn = Connection::client(client_side, ConnectionOptions::default());

    let reply = client_conn
        .client_handle()
        .unary("/svc/echo", Bytes::from_static(b"over the pipe"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"over the pipe");
}
