//! End-to-end exchanges between [`ClientSession`] and [`TaskwireServer`].

mod common;

use std::{sync::Arc, time::Duration};

use common::{ChannelSink, EchoExecutor, ScriptedExecutor, TestResult, raw, start_server, ws_url};
use futures::{SinkExt, StreamExt};
use serde_json::value::RawValue;
use taskwire::{
    ErrorCode,
    client::{CallOptions, ClientError, ClientSession},
    codec,
    envelope::{Envelope, RequestItem},
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinSet, time::timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn call_round_trips_through_the_host() -> TestResult {
    let server = start_server(EchoExecutor).await?;
    let session = ClientSession::builder(ws_url(server.addr)).build();

    let reply = session.call(raw(r#"{"op":"ping"}"#)).await?;
    assert_eq!(reply.get(), r#"{"op":"ping"}"#);
    Ok(())
}

/// A slow request must not delay the reply to a later, faster one, and the
/// slow request must still resolve correctly when its reply finally arrives.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_request_does_not_delay_later_replies() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let session = Arc::new(ClientSession::builder(ws_url(server.addr)).build());
    session.connect().await?;

    let slow = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.call(raw(r#"{"delayMs":50,"value":"slow"}"#)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let fast_started = tokio::time::Instant::now();
    let fast = session.call(raw(r#"{"delayMs":5,"value":"fast"}"#)).await?;
    assert_eq!(fast.get(), r#""fast""#);
    assert!(
        fast_started.elapsed() < Duration::from_millis(35),
        "fast reply waited on the slow request"
    );

    let slow = slow.await.expect("join slow call")?;
    assert_eq!(slow.get(), r#""slow""#);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_each_resolve_to_their_own_reply() -> TestResult {
    let server = start_server(EchoExecutor).await?;
    let session = Arc::new(ClientSession::builder(ws_url(server.addr)).build());
    session.connect().await?;

    let mut calls = JoinSet::new();
    for n in 0..32 {
        let session = Arc::clone(&session);
        calls.spawn(async move {
            let reply = session.call(raw(&format!(r#"{{"n":{n}}}"#))).await?;
            Ok::<_, ClientError>((n, reply))
        });
    }
    while let Some(joined) = calls.join_next().await {
        let (n, reply) = joined.expect("join call")?;
        assert_eq!(reply.get(), format!(r#"{{"n":{n}}}"#));
    }
    Ok(())
}

/// Events reach the registered sink without touching the correlator; calls
/// pending at delivery time are unaffected.
#[tokio::test]
async fn events_bypass_correlation_and_leave_pending_calls_alone() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = Arc::new(
        ClientSession::builder(ws_url(server.addr))
            .event_sink(ChannelSink(events_tx))
            .build(),
    );
    session.connect().await?;

    let mut pending = Vec::new();
    for _ in 0..3 {
        pending.push(tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call(raw(r#"{"delayMs":100,"value":1}"#)).await }
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let payload = raw(r#"{"keys":[3]}"#);
    let delivered = server.registry.broadcast_event("cache/invalidate", Some(&payload))?;
    assert_eq!(delivered, 1);

    let event = timeout(Duration::from_secs(1), events_rx.recv())
        .await?
        .expect("event delivered");
    assert_eq!(event.name, "cache/invalidate");
    assert_eq!(event.payload.as_deref().map(RawValue::get), Some(r#"{"keys":[3]}"#));

    for call in pending {
        let reply = timeout(Duration::from_secs(1), call).await?.expect("join call")?;
        assert_eq!(reply.get(), "1");
    }
    Ok(())
}

/// Tearing the connection down resolves every pending call promptly, exactly
/// once, instead of leaving callers hanging.
#[tokio::test]
async fn teardown_resolves_every_pending_call() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let session = Arc::new(ClientSession::builder(ws_url(server.addr)).build());
    session.connect().await?;

    let mut pending = Vec::new();
    for _ in 0..2 {
        pending.push(tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call(raw(r#"{"delayMs":5000,"value":1}"#)).await }
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.shutdown.cancel();

    for call in pending {
        let result = timeout(Duration::from_secs(1), call).await?.expect("join call");
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }
    Ok(())
}

#[tokio::test]
async fn caller_cancellation_aborts_the_wait_immediately() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let session = Arc::new(ClientSession::builder(ws_url(server.addr)).build());
    let cancel = CancellationToken::new();

    let call = tokio::spawn({
        let session = Arc::clone(&session);
        let options = CallOptions::cancel(cancel.clone());
        async move {
            session
                .call_with(raw(r#"{"delayMs":5000,"value":1}"#), options)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancel.cancel();
    let result = timeout(Duration::from_millis(200), call).await?.expect("join call");
    assert!(matches!(result, Err(ClientError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn per_call_deadline_resolves_the_wait() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let session = ClientSession::builder(ws_url(server.addr)).build();

    let result = session
        .call_with(
            raw(r#"{"delayMs":5000,"value":1}"#),
            CallOptions::timeout(Duration::from_millis(30)),
        )
        .await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));
    Ok(())
}

/// Task failures travel back through the normal reply channel as structured
/// errors; the connection stays usable afterwards.
#[tokio::test]
async fn task_failures_arrive_as_structured_errors() -> TestResult {
    let server = start_server(ScriptedExecutor).await?;
    let session = ClientSession::builder(ws_url(server.addr)).build();

    let result = session.call(raw(r#"{"fail":"boom"}"#)).await;
    match result {
        Err(ClientError::Task(info)) => {
            assert_eq!(info.code, ErrorCode::Internal);
            assert_eq!(info.message, "boom");
        }
        other => panic!("expected a task error, got {other:?}"),
    }

    let reply = session.call(raw(r#"{"value":"still alive"}"#)).await?;
    assert_eq!(reply.get(), r#""still alive""#);
    Ok(())
}

/// Concurrent callers needing a connection share one connect attempt rather
/// than each opening a socket.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_coalesce_into_one_socket() -> TestResult {
    let server = start_server(EchoExecutor).await?;
    let session = Arc::new(ClientSession::builder(ws_url(server.addr)).build());

    let mut connects = JoinSet::new();
    for _ in 0..16 {
        let session = Arc::clone(&session);
        connects.spawn(async move { session.connect().await });
    }
    while let Some(joined) = connects.join_next().await {
        joined.expect("join connect")?;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(server.registry.active_ids().len(), 1);
    Ok(())
}

/// One malformed message is answered (when its id can be peeked) or dropped;
/// either way the connection survives it.
#[tokio::test]
async fn malformed_messages_do_not_kill_the_connection() -> TestResult {
    let server = start_server(EchoExecutor).await?;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(server.addr)).await?;

    // Unknown discriminator: logged and discarded, no reply.
    ws.send(Message::Text(r#"{"type":"telemetry"}"#.into())).await?;
    // Peekable id but missing payload: answered with a bad-request error.
    ws.send(Message::Text(r#"{"type":"request","reqId":9}"#.into())).await?;

    let reply = timeout(Duration::from_secs(1), ws.next())
        .await?
        .expect("reply arrives")?;
    let Message::Text(text) = reply else {
        panic!("expected a text reply");
    };
    match codec::decode(text.as_bytes())? {
        Envelope::Error { req_id, error } => {
            assert_eq!(req_id, 9);
            assert_eq!(error.code, ErrorCode::BadRequest);
        }
        other => panic!("decoded to {:?}", other.kind()),
    }

    // The same connection still serves well-formed requests.
    let request = codec::encode(&Envelope::request(10, raw(r#""hello""#)))?;
    ws.send(Message::Text(String::from_utf8(request)?)).await?;
    let reply = timeout(Duration::from_secs(1), ws.next())
        .await?
        .expect("reply arrives")?;
    let Message::Text(text) = reply else {
        panic!("expected a text reply");
    };
    match codec::decode(text.as_bytes())? {
        Envelope::Response { req_id, payload } => {
            assert_eq!(req_id, 10);
            assert_eq!(payload.get(), r#""hello""#);
        }
        other => panic!("decoded to {:?}", other.kind()),
    }
    Ok(())
}

/// A batch sent over the socket is answered element by element, each reply
/// correlating individually.
#[tokio::test]
async fn socket_batches_are_answered_per_element() -> TestResult {
    let server = start_server(EchoExecutor).await?;
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(server.addr)).await?;

    let batch = codec::encode(&Envelope::batch(vec![
        RequestItem {
            req_id: 1,
            payload: raw(r#""a""#),
        },
        RequestItem {
            req_id: 2,
            payload: raw(r#""b""#),
        },
    ]))?;
    ws.send(Message::Text(String::from_utf8(batch)?)).await?;

    let mut seen = std::collections::HashMap::new();
    while seen.len() < 2 {
        let reply = timeout(Duration::from_secs(1), ws.next())
            .await?
            .expect("reply arrives")?;
        let Message::Text(text) = reply else {
            panic!("expected a text reply");
        };
        match codec::decode(text.as_bytes())? {
            Envelope::Response { req_id, payload } => {
                seen.insert(req_id, payload.get().to_owned());
            }
            other => panic!("decoded to {:?}", other.kind()),
        }
    }
    assert_eq!(seen.get(&1).map(String::as_str), Some(r#""a""#));
    assert_eq!(seen.get(&2).map(String::as_str), Some(r#""b""#));
    Ok(())
}

/// Sequential calls carry pairwise distinct, strictly increasing request ids,
/// observed from the host side of the wire.
#[tokio::test]
async fn request_ids_are_distinct_and_increasing() -> TestResult {
    const CALLS: usize = 16;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let host = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        let mut seen = Vec::new();
        while seen.len() < CALLS {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Envelope::Request { req_id, payload }) =
                        codec::decode(text.as_bytes())
                    {
                        seen.push(req_id);
                        let reply = codec::encode(&Envelope::response(req_id, payload))
                            .expect("encode reply");
                        ws.send(Message::Text(String::from_utf8(reply).expect("UTF-8")))
                            .await
                            .expect("send reply");
                    }
                }
                _ => break,
            }
        }
        seen
    });

    let session = ClientSession::builder(format!("ws://{addr}/")).build();
    for n in 0..CALLS {
        session.call(raw(&n.to_string())).await?;
    }

    let seen = host.await.expect("join host");
    assert_eq!(seen.len(), CALLS);
    assert!(
        seen.windows(2).all(|pair| pair[0] < pair[1]),
        "request ids must increase in call order: {seen:?}"
    );
    Ok(())
}

/// Abandoning a call sends the host a best-effort cancel notice carrying the
/// abandoned request's id.
#[tokio::test]
async fn abandoned_calls_send_a_cancel_notice() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let host = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        let mut request_id = None;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    match codec::decode(text.as_bytes()).expect("valid envelope") {
                        // Never answered, so the caller's deadline fires.
                        Envelope::Request { req_id, .. } => request_id = Some(req_id),
                        Envelope::Cancel { req_id } => return (request_id, req_id),
                        other => panic!("unexpected {:?}", other.kind()),
                    }
                }
                _ => panic!("socket closed before the cancel notice"),
            }
        }
    });

    let session = ClientSession::builder(format!("ws://{addr}/")).build();
    let result = session
        .call_with(raw("1"), CallOptions::timeout(Duration::from_millis(30)))
        .await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));

    let (requested, cancelled) = timeout(Duration::from_secs(1), host).await?.expect("join host");
    assert_eq!(Some(cancelled), requested);
    Ok(())
}

/// A failed connect surfaces to every waiting caller, and the next call
/// dials fresh instead of reusing the failed attempt.
#[tokio::test]
async fn failed_connects_are_not_cached() -> TestResult {
    // Nothing is listening on this port once the listener drops.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let session = ClientSession::builder(format!("ws://{addr}/")).build();
    assert!(matches!(
        session.connect().await,
        Err(ClientError::Connect(_))
    ));
    // The slot was cleared; a second attempt fails the same way rather than
    // observing a stale future.
    assert!(matches!(
        session.connect().await,
        Err(ClientError::Connect(_))
    ));
    Ok(())
}
