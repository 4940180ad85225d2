//! End-to-end scenarios over real peers: routing, metadata, transfer
//! pipes, deadlines, redial and teardown behavior.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use colloquy::prelude::*;
use colloquy::status::code;
use colloquy::{xfer, CallOptions, GzipFilter, SessionState};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn tcp_config() -> PeerConfig {
    PeerConfig {
        network: "tcp".to_owned(),
        local_ip: "127.0.0.1".to_owned(),
        listen_port: 0,
        ..Default::default()
    }
}

fn mem_config(name: u16) -> PeerConfig {
    PeerConfig {
        network: "mem".to_owned(),
        listen_port: name,
        ..Default::default()
    }
}

/// Spawn the accept loop and wait for the listener to bind.
async fn serve(peer: Arc<Peer>) {
    let p = Arc::clone(&peer);
    tokio::spawn(async move {
        if let Err(status) = p.listen_and_serve().await {
            tracing::error!(%status, "listen_and_serve failed");
        }
    });
    for _ in 0..500 {
        if peer.listen_addr().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("listener did not come up");
}

// S1: basic CALL with the RPC-style mapper and metadata.
#[tokio::test]
async fn basic_call_with_rpc_mapper() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.set_service_method_mapper(ServiceMethodMapper::RpcService);
    srv.route_call("Home", "Test", |ctx: CallCtx, arg: Value| async move {
        if ctx.peek_meta_str("peer_id") != Some("110") {
            return Err(Status::handler_error("missing peer_id meta"));
        }
        let author = arg["Author"].as_str().unwrap_or_default();
        Ok(json!({ "Author": format!("{author}->OK") }))
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();
    let result: Value = sess
        .call(
            "Home.Test",
            json!({ "Author": "andeya" }),
            CallOptions::new().with_add_meta("peer_id", "110"),
        )
        .await
        .unwrap();
    assert_eq!(result["Author"], "andeya->OK");

    cli.close().await;
    srv.close().await;
}

// S2: IgnoreCase on both sides, HTTP mapper, and a server-initiated
// PUSH back to the caller.
#[tokio::test]
async fn case_insensitive_routing_and_push() {
    init_tracing();
    let srv = Arc::new(Peer::with_plugins(tcp_config(), vec![IgnoreCase::new()]).unwrap());
    srv.route_call("Home", "Test", |ctx: CallCtx, arg: Value| async move {
        let your_id = ctx.peek_meta_str("peer_id").unwrap_or_default().to_owned();
        ctx.push("/push/test", json!({ "your_id": your_id })).await?;
        Ok(json!({ "arg": arg }))
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let cli = Peer::with_plugins(tcp_config(), vec![IgnoreCase::new()]).unwrap();
    cli.route_push("Push", "Test", move |_ctx: PushCtx, arg: Value| {
        let push_tx = push_tx.clone();
        async move {
            let _ = push_tx.send(arg);
            Ok(())
        }
    })
    .unwrap();

    let sess = cli.dial(&addr).await.unwrap();
    let result: Value = sess
        .call(
            "/home/TesT",
            json!({ "author": "andeya" }),
            CallOptions::new().with_add_meta("peer_id", "110"),
        )
        .await
        .unwrap();
    assert_eq!(result["arg"]["author"], "andeya");

    let pushed = tokio::time::timeout(Duration::from_secs(2), push_rx.recv())
        .await
        .expect("push not received")
        .unwrap();
    assert_eq!(pushed["your_id"], "110");

    cli.close().await;
    srv.close().await;
}

// S3: gzip transfer pipe applied on the call; handler sees the decoded
// body, and the reply reverses cleanly on the caller side.
#[tokio::test]
async fn transfer_pipe_round_trip() {
    init_tracing();
    GzipFilter::register().unwrap();

    let payload = "the quick brown fox ".repeat(200);
    let expected = payload.clone();

    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Blob", "Echo", move |_ctx: CallCtx, arg: Value| {
        let expected = expected.clone();
        async move {
            assert_eq!(arg["data"].as_str(), Some(expected.as_str()));
            Ok::<_, Status>(arg)
        }
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();
    let result: Value = sess
        .call(
            "/blob/echo",
            json!({ "data": payload }),
            CallOptions::new().with_xfer_pipe(&[xfer::GZIP]),
        )
        .await
        .unwrap();
    assert_eq!(result["data"].as_str(), Some(payload.as_str()));

    cli.close().await;
    srv.close().await;
}

// S4: per-call deadline fires while the handler sleeps; the late reply
// is discarded and the session keeps working.
#[tokio::test]
async fn call_deadline_times_out() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Slow", "Nap", |_ctx: CallCtx, _arg: Value| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok::<_, Status>(json!("done"))
    })
    .unwrap();
    srv.route_call("Quick", "Ping", |_ctx: CallCtx, _arg: Value| async move {
        Ok::<_, Status>(json!("pong"))
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();

    let err = sess
        .call::<_, Value>(
            "/slow/nap",
            json!(null),
            CallOptions::new().with_context_age(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::TIMEOUT);
    assert_eq!(sess.pending_calls(), 0);

    // The session stays usable while the stale handler is still asleep…
    let pong: String = sess
        .call("/quick/ping", json!(null), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    // …and after its reply arrives for a seq nobody waits on.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let pong: String = sess
        .call("/quick/ping", json!(null), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    cli.close().await;
    srv.close().await;
}

// S5: unlimited redial; inflight calls fail on disconnect, later calls
// on the same session handle succeed once the server is back.
#[tokio::test]
async fn redial_after_server_restart() {
    init_tracing();

    fn make_server() -> Arc<Peer> {
        let srv = Arc::new(Peer::new(mem_config(9505)).unwrap());
        srv.route_call("Echo", "Ping", |_ctx: CallCtx, _arg: Value| async move {
            Ok::<_, Status>(json!("pong"))
        })
        .unwrap();
        srv.route_call("Slow", "Nap", |_ctx: CallCtx, _arg: Value| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Status>(json!("done"))
        })
        .unwrap();
        srv
    }

    let srv = make_server();
    serve(Arc::clone(&srv)).await;

    let cli = Peer::new(PeerConfig {
        redial_times: -1,
        redial_interval: Duration::from_millis(50),
        ..mem_config(0)
    })
    .unwrap();
    let sess = cli.dial("9505").await.unwrap();
    let pong: String = sess
        .call("/echo/ping", json!(null), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    // Park a call inflight, then take the server down underneath it.
    let parked = {
        let sess = sess.clone();
        tokio::spawn(async move {
            sess.call::<_, Value>("/slow/nap", json!(null), CallOptions::new())
                .await
        })
    };
    for _ in 0..200 {
        if sess.pending_calls() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sess.pending_calls(), 1);
    srv.close().await;

    let err = parked.await.unwrap().unwrap_err();
    assert_eq!(err.code(), code::TRANSPORT_ERROR);

    // Bring a fresh server up under the same address.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let srv = make_server();
    serve(Arc::clone(&srv)).await;

    let mut recovered = false;
    for _ in 0..100 {
        match sess
            .call::<_, String>("/echo/ping", json!(null), CallOptions::new())
            .await
        {
            Ok(pong) => {
                assert_eq!(pong, "pong");
                recovered = true;
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    assert!(recovered, "session did not recover after redial");

    cli.close().await;
    srv.close().await;
}

// S6: a frame over the receiver's read limit kills the session with a
// protocol error; the sender's pending call resolves as a transport
// error.
#[tokio::test]
async fn oversized_frame_closes_session() {
    init_tracing();
    let srv = Arc::new(
        Peer::new(PeerConfig {
            read_limit: 256,
            ..mem_config(9506)
        })
        .unwrap(),
    );
    srv.route_call("Echo", "Ping", |_ctx: CallCtx, arg: Value| async move {
        Ok::<_, Status>(arg)
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;

    let cli = Peer::new(mem_config(0)).unwrap();
    let sess = cli.dial("9506").await.unwrap();

    let small: Value = sess
        .call("/echo/ping", json!("ok"), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(small, json!("ok"));

    let big = "x".repeat(1024);
    let err = sess
        .call::<_, Value>("/echo/ping", json!(big), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::TRANSPORT_ERROR);

    tokio::time::timeout(Duration::from_secs(2), sess.closed())
        .await
        .expect("sender session should close after the peer drops it");

    cli.close().await;
    srv.close().await;
}

// Property 3: concurrent calls on one session correlate strictly by
// seq, even when handlers finish out of order.
#[tokio::test]
async fn concurrent_calls_correlate_by_seq() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Echo", "Tag", |_ctx: CallCtx, arg: Value| async move {
        let tag = arg["tag"].as_i64().unwrap_or(-1);
        // Shuffle completion order.
        let nap = (tag as u64 * 7) % 23;
        tokio::time::sleep(Duration::from_millis(nap)).await;
        Ok::<_, Status>(json!({ "tag": tag }))
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();

    let mut tasks = Vec::new();
    for tag in 0..32i64 {
        let sess = sess.clone();
        tasks.push(tokio::spawn(async move {
            let reply: Value = sess
                .call("/echo/tag", json!({ "tag": tag }), CallOptions::new())
                .await?;
            Ok::<_, Status>((tag, reply))
        }));
    }
    for task in tasks {
        let (tag, reply) = task.await.unwrap().unwrap();
        assert_eq!(reply["tag"], tag, "reply crossed between callers");
    }

    cli.close().await;
    srv.close().await;
}

// Property 4: closing a session with k inflight calls fails each caller
// with a transport error exactly once.
#[tokio::test]
async fn close_fails_all_inflight_exactly_once() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Slow", "Nap", |_ctx: CallCtx, _arg: Value| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, Status>(json!(null))
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();

    const K: usize = 8;
    let mut tasks = Vec::new();
    for _ in 0..K {
        let sess = sess.clone();
        tasks.push(tokio::spawn(async move {
            sess.call::<_, Value>("/slow/nap", json!(null), CallOptions::new())
                .await
        }));
    }
    for _ in 0..500 {
        if sess.pending_calls() == K {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sess.pending_calls(), K);

    sess.close().await;
    assert_eq!(sess.state(), SessionState::Closed);

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), code::TRANSPORT_ERROR);
    }
    assert_eq!(sess.pending_calls(), 0);

    cli.close().await;
    srv.close().await;
}

// Property 5: a duplicate REPLY for an already-resolved seq is
// discarded and later traffic is unaffected.
#[tokio::test]
async fn duplicate_reply_is_discarded() {
    use colloquy::Message;
    use colloquy_core::proto::{Proto as _, RawProto};
    use colloquy_core::transport::mem::MemTransport;
    use colloquy_core::transport::Transport as _;

    init_tracing();

    // A hand-driven responder that answers every CALL twice.
    let mut listener = MemTransport.listen("dup-reply").await.unwrap();
    tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let (mut reader, mut writer) = tokio::io::split(conn.stream);
        loop {
            let msg = match RawProto
                .unpack(&mut reader, colloquy_core::DEFAULT_READ_LIMIT)
                .await
            {
                Ok(msg) => msg,
                Err(_) => return,
            };
            let mut reply = Message::new_reply(&msg, Status::ok());
            reply.body = msg.body.clone();
            if RawProto.pack(&mut writer, &mut reply).await.is_err() {
                return;
            }
            let mut dup = reply.clone();
            if RawProto.pack(&mut writer, &mut dup).await.is_err() {
                return;
            }
        }
    });

    let cli = Peer::new(mem_config(0)).unwrap();
    let sess = cli.dial("dup-reply").await.unwrap();

    let first: Value = sess
        .call("/any/route", json!({ "n": 1 }), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(first["n"], 1);

    // The duplicate of the first reply must not poison this call.
    let second: Value = sess
        .call("/any/route", json!({ "n": 2 }), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(second["n"], 2);

    cli.close().await;
}

// Calls on a closed session fail fast, and peers drop closed sessions
// from their books.
#[tokio::test]
async fn closed_session_rejects_calls() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Echo", "Ping", |_ctx: CallCtx, arg: Value| async move {
        Ok::<_, Status>(arg)
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli.dial(&addr).await.unwrap();
    assert_eq!(cli.session_count(), 1);

    sess.close().await;
    let err = sess
        .call::<_, Value>("/echo/ping", json!(null), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::TRANSPORT_ERROR);
    assert_eq!(cli.session_count(), 0);

    // The server notices the disconnect and forgets the session too.
    for _ in 0..200 {
        if srv.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(srv.session_count(), 0);

    srv.close().await;
}

// Both peers on the JSON protocol variant; same semantics as RAW.
#[tokio::test]
async fn json_protocol_end_to_end() {
    use colloquy::json_proto_func;

    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Home", "Test", |_ctx: CallCtx, arg: Value| async move {
        Ok::<_, Status>(json!({ "arg": arg }))
    })
    .unwrap();
    {
        let srv = Arc::clone(&srv);
        tokio::spawn(async move {
            let _ = srv.listen_and_serve_with(json_proto_func()).await;
        });
    }
    for _ in 0..500 {
        if srv.listen_addr().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let addr = srv.listen_addr().expect("listener did not come up");

    let cli = Peer::new(tcp_config()).unwrap();
    let sess = cli
        .dial_with_proto(&addr, json_proto_func())
        .await
        .unwrap();
    let result: Value = sess
        .call("/home/test", json!({ "author": "andeya" }), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(result["arg"]["author"], "andeya");

    cli.close().await;
    srv.close().await;
}

// A session with a bounded age closes itself at expiry and is not
// usable afterwards.
#[tokio::test]
async fn session_age_expires_the_session() {
    init_tracing();
    let srv = Arc::new(Peer::new(tcp_config()).unwrap());
    srv.route_call("Echo", "Ping", |_ctx: CallCtx, arg: Value| async move {
        Ok::<_, Status>(arg)
    })
    .unwrap();
    serve(Arc::clone(&srv)).await;
    let addr = srv.listen_addr().unwrap();

    let cli = Peer::new(PeerConfig {
        default_session_age: Duration::from_millis(300),
        ..tcp_config()
    })
    .unwrap();
    let sess = cli.dial(&addr).await.unwrap();
    let echoed: Value = sess
        .call("/echo/ping", json!(1), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(echoed, json!(1));

    tokio::time::timeout(Duration::from_secs(2), sess.closed())
        .await
        .expect("session should close at age expiry");
    assert_eq!(sess.state(), SessionState::Closed);

    let err = sess
        .call::<_, Value>("/echo/ping", json!(2), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), code::TRANSPORT_ERROR);

    cli.close().await;
    srv.close().await;
}
