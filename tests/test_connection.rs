use std::sync::{Arc, Mutex};
use std::time::Duration;

use redmux::adapter::{Ignore, MapOf, One, Opt, Seq};
use redmux::{CancelScope, Connection, ConnectionConfig, ErrorKind};
use tokio::io::duplex;
use tokio::task::yield_now;
use tokio::time::timeout;

mod support;
use support::{bulk, default_reply, message_push, serve, ServerReply};

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1:0")
        .set_hello_on_connect(false)
        .set_health_check_interval(Duration::ZERO)
}

async fn settle() {
    for _ in 0..8 {
        yield_now().await;
    }
}

#[tokio::test]
async fn hello_priority_orders_the_queue() {
    let conn = Connection::new(test_config());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let h1 = tokio::spawn({
        let conn = conn.clone();
        let order = order.clone();
        async move {
            let mut req = conn.request();
            req.push("PING", "req1");
            conn.exec(req, &mut Ignore).await.unwrap();
            order.lock().unwrap().push("req1");
        }
    });
    settle().await;

    let h2 = tokio::spawn({
        let conn = conn.clone();
        let order = order.clone();
        async move {
            let mut req = conn.request();
            req.config_mut().hello_with_priority = false;
            req.push("HELLO", 3);
            req.push("PING", "req2");
            req.push("QUIT", ());
            conn.exec(req, &mut Ignore).await.unwrap();
            order.lock().unwrap().push("req2");
        }
    });
    settle().await;

    let h3 = tokio::spawn({
        let conn = conn.clone();
        let order = order.clone();
        async move {
            let mut req = conn.request();
            req.push("HELLO", 3);
            req.push("PING", "req3");
            conn.exec(req, &mut Ignore).await.unwrap();
            order.lock().unwrap().push("req3");
        }
    });
    settle().await;

    let (client, server) = duplex(4096);
    let server_task = tokio::spawn(serve(server, default_reply));
    let _ = conn.run_on(client).await;

    for handle in [h1, h2, h3] {
        handle.await.unwrap();
    }
    server_task.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["req3", "req1", "req2"]);
}

#[tokio::test]
async fn wrong_response_shape_reports_adapter_error() {
    let conn = Connection::new(test_config());

    let exec = tokio::spawn({
        let conn = conn.clone();
        async move {
            let mut req = conn.request();
            req.push("HELLO", 3);
            req.push("QUIT", ());
            let mut sink = (Ignore, One::<i64>::new());
            let err = conn.exec(req, &mut sink).await.unwrap_err();
            (err.kind(), sink.1.into_result().unwrap_err().kind())
        }
    });
    settle().await;

    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, default_reply));
    let run_err = conn.run_on(client).await.unwrap_err();
    assert_eq!(run_err.kind(), ErrorKind::ConnectionLost);

    let (exec_kind, slot_kind) = exec.await.unwrap();
    assert_eq!(exec_kind, ErrorKind::NotANumber);
    assert_eq!(slot_kind, ErrorKind::NotANumber);
}

#[tokio::test]
async fn cancel_if_not_connected_fails_immediately() {
    let conn = Connection::new(test_config());
    let mut req = conn.request();
    req.config_mut().cancel_if_not_connected = true;
    req.push("HELLO", 3);
    req.push("PING", ());
    let err = conn.exec(req, &mut Ignore).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn transaction_adapts_into_a_nested_tuple() {
    let conn = Connection::new(test_config());
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |verb, _| match verb {
        "MULTI" => ServerReply::Send(b"+OK\r\n".to_vec()),
        "GET" | "LRANGE" | "HGETALL" => ServerReply::Send(b"+QUEUED\r\n".to_vec()),
        "EXEC" => ServerReply::Send(
            b"*3\r\n$5\r\nhello\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n%1\r\n$1\r\nf\r\n$1\r\nv\r\n"
                .to_vec(),
        ),
        _ => ServerReply::Send(b"-ERR unexpected\r\n".to_vec()),
    }));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let mut req = conn.request();
    req.push("MULTI", ());
    req.push("GET", "key1");
    req.push("LRANGE", ("key2", 0, -1));
    req.push("HGETALL", "key3");
    req.push("EXEC", ());

    let mut sink = (
        One::<String>::new(),
        Ignore,
        Ignore,
        Ignore,
        (
            Opt::new(One::<String>::new()),
            Opt::new(Seq::<String>::new()),
            Opt::new(MapOf::<String, String>::new()),
        ),
    );
    let written = conn.exec(req, &mut sink).await.unwrap();
    assert_eq!(written, 5);
    assert_eq!(sink.0.into_result().unwrap(), "OK");

    let (first, second, third) = sink.4;
    assert_eq!(
        first.into_option().unwrap().unwrap().into_result().unwrap(),
        "hello"
    );
    assert_eq!(
        second.into_option().unwrap().unwrap().into_result().unwrap(),
        vec!["a", "b"]
    );
    assert_eq!(
        third.into_option().unwrap().unwrap().into_result().unwrap(),
        vec![("f".to_string(), "v".to_string())]
    );

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn streamed_blob_reply_end_to_end() {
    let conn = Connection::new(test_config());
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |verb, _| match verb {
        "GET" => ServerReply::Send(
            b"$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;1\r\nd\r\n;0\r\n".to_vec(),
        ),
        _ => ServerReply::Send(b"-ERR unexpected\r\n".to_vec()),
    }));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let mut req = conn.request();
    req.push("GET", "chunky");
    let mut sink = One::<String>::new();
    conn.exec(req, &mut sink).await.unwrap();
    assert_eq!(sink.into_result().unwrap(), "Hello word");

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn pushes_are_routed_past_pipelined_replies() {
    let conn = Connection::new(test_config());
    let (client, server) = duplex(4096);
    let pings = Arc::new(Mutex::new(0u32));
    tokio::spawn(serve(server, {
        let pings = pings.clone();
        move |verb, args| match verb {
            "SUBSCRIBE" => default_reply(verb, args),
            "PING" => {
                let mut count = pings.lock().unwrap();
                *count += 1;
                let reply = bulk(&args[0]);
                if *count == 2 {
                    // A publish lands between the second and third reply.
                    let mut bytes = message_push("c", "payload");
                    bytes.extend_from_slice(&reply);
                    ServerReply::Send(bytes)
                } else {
                    ServerReply::Send(reply)
                }
            }
            _ => ServerReply::Send(b"-ERR unexpected\r\n".to_vec()),
        }
    }));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let mut req = conn.request();
    req.push("SUBSCRIBE", "c");
    conn.exec(req, &mut ()).await.unwrap();

    let mut req = conn.request();
    req.push("PING", "p1");
    req.push("PING", "p2");
    req.push("PING", "p3");
    let mut sink = (
        One::<String>::new(),
        One::<String>::new(),
        One::<String>::new(),
    );
    conn.exec(req, &mut sink).await.unwrap();
    assert_eq!(sink.0.into_result().unwrap(), "p1");
    assert_eq!(sink.1.into_result().unwrap(), "p2");
    assert_eq!(sink.2.into_result().unwrap(), "p3");

    // The subscribe acknowledgement and the publish, in arrival order.
    let ack = conn.receive().await.unwrap();
    assert_eq!(ack[1].value.as_blob(), Some(&b"subscribe"[..]));
    let publish = conn.receive().await.unwrap();
    assert_eq!(publish[1].value.as_blob(), Some(&b"message"[..]));
    assert_eq!(publish[2].value.as_blob(), Some(&b"c"[..]));
    assert_eq!(publish[3].value.as_blob(), Some(&b"payload"[..]));

    // Exactly once: nothing further is pending.
    assert!(timeout(Duration::from_millis(50), conn.receive())
        .await
        .is_err());

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn queue_survives_reconnect_and_retransmits() {
    let conn = Connection::new(test_config());

    let exec = tokio::spawn({
        let conn = conn.clone();
        async move {
            let mut req = conn.request();
            req.config_mut().cancel_on_connection_lost = false;
            req.push("PING", "persist");
            let mut sink = One::<String>::new();
            conn.exec(req, &mut sink).await?;
            sink.into_result()
        }
    });
    settle().await;

    // First session: the server swallows the command and drops the link.
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |_, _| ServerReply::SendAndClose(Vec::new())));
    let err = conn.run_on(client).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    settle().await;
    assert!(!exec.is_finished());

    // Second session: the retransmitted request gets its answer.
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, default_reply));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let value = timeout(Duration::from_secs(1), exec)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, "persist");

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn default_requests_fail_on_connection_loss() {
    let conn = Connection::new(test_config());

    let exec = tokio::spawn({
        let conn = conn.clone();
        async move {
            let mut req = conn.request();
            req.push("PING", ());
            conn.exec(req, &mut Ignore).await
        }
    });
    settle().await;

    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |_, _| ServerReply::SendAndClose(Vec::new())));
    conn.run_on(client).await.unwrap_err();

    let err = exec.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}

#[tokio::test]
async fn cancel_exec_fails_unwritten_requests() {
    let conn = Connection::new(test_config());

    let exec = tokio::spawn({
        let conn = conn.clone();
        async move {
            let mut req = conn.request();
            req.push("PING", ());
            conn.exec(req, &mut Ignore).await
        }
    });
    settle().await;
    conn.cancel(CancelScope::Exec);

    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, default_reply));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let err = timeout(Duration::from_secs(1), exec)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn cancel_receive_wakes_waiters() {
    let conn = Connection::new(test_config());
    let receive = tokio::spawn({
        let conn = conn.clone();
        async move { conn.receive().await }
    });
    settle().await;
    conn.cancel(CancelScope::Receive);
    let err = receive.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn dropping_an_in_flight_exec_tears_the_connection_down() {
    let conn = Connection::new(test_config());
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |_, _| ServerReply::Ignore));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let mut req = conn.request();
    req.push("PING", ());
    let elapsed = timeout(Duration::from_millis(50), conn.exec(req, &mut Ignore)).await;
    assert!(elapsed.is_err());

    let err = timeout(Duration::from_secs(1), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}

#[tokio::test]
async fn missed_health_checks_fail_with_pong_timeout() {
    let config = ConnectionConfig::new("127.0.0.1:0")
        .set_hello_on_connect(false)
        .set_health_check_interval(Duration::from_millis(50));
    let conn = Connection::new(config);
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |_, _| ServerReply::Ignore));

    let err = timeout(Duration::from_secs(5), conn.run_on(client))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PongTimeout);
}

#[tokio::test]
async fn rejected_handshake_is_fatal() {
    let config = ConnectionConfig::new("127.0.0.1:0").set_health_check_interval(Duration::ZERO);
    let conn = Connection::new(config);
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |verb, _| match verb {
        "HELLO" => ServerReply::Send(b"-ERR unsupported protocol version\r\n".to_vec()),
        _ => ServerReply::Ignore,
    }));

    let err = timeout(Duration::from_secs(1), conn.run_on(client))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
}

#[tokio::test]
async fn handshake_carries_credentials_atomically() {
    let config = ConnectionConfig::new("127.0.0.1:0")
        .set_health_check_interval(Duration::ZERO)
        .set_auth("user", "secret");
    let conn = Connection::new(config);
    let hello_args: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();

    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, {
        let hello_args = hello_args.clone();
        move |verb, args| {
            if verb == "HELLO" {
                *hello_args.lock().unwrap() = args.to_vec();
            }
            default_reply(verb, args)
        }
    }));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let mut req = conn.request();
    req.push("PING", "after-auth");
    let mut sink = One::<String>::new();
    conn.exec(req, &mut sink).await.unwrap();
    assert_eq!(sink.into_result().unwrap(), "after-auth");

    let args = hello_args.lock().unwrap().clone();
    let args: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
    assert_eq!(args, vec![&b"3"[..], b"AUTH", b"user", b"secret"]);

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn set_get_roundtrip_preserves_binary_payloads() {
    let conn = Connection::new(test_config());
    let stored: Arc<Mutex<Vec<u8>>> = Arc::default();

    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, {
        let stored = stored.clone();
        move |verb, args| match verb {
            "SET" => {
                *stored.lock().unwrap() = args[1].clone();
                ServerReply::Send(b"+OK\r\n".to_vec())
            }
            "GET" => ServerReply::Send(bulk(&stored.lock().unwrap())),
            _ => ServerReply::Send(b"-ERR unexpected\r\n".to_vec()),
        }
    }));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });

    let payload = b"bin\r\nwith\x00bytes\r\n".to_vec();
    let mut req = conn.request();
    req.push("SET", ("k", payload.clone()));
    req.push("GET", "k");
    let mut sink = (One::<String>::new(), One::<Vec<u8>>::new());
    conn.exec(req, &mut sink).await.unwrap();
    assert_eq!(sink.0.into_result().unwrap(), "OK");
    assert_eq!(sink.1.into_result().unwrap(), payload);

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}

#[tokio::test]
async fn run_is_exclusive() {
    let conn = Connection::new(test_config());
    let (client, server) = duplex(4096);
    tokio::spawn(serve(server, |_, _| ServerReply::Ignore));
    let run = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_on(client).await }
    });
    settle().await;

    let (client2, _server2) = duplex(4096);
    let err = conn.run_on(client2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientError);

    conn.cancel(CancelScope::Run);
    let _ = run.await.unwrap();
}
