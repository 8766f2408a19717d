//! End-to-end socket engine scenarios over in-memory duplex streams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pakt::{Codec, Context, Error, MsgPack, Socket};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestData {
    a: String,
    b: String,
    c: i64,
}

fn test_data() -> TestData {
    TestData {
        a: "Hallo".into(),
        b: "Welt".into(),
        c: 2408234082374023,
    }
}

fn socket_pair() -> (Arc<Socket>, Arc<Socket>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    (Socket::new(left), Socket::new(right))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn call_round_trips_payload() {
    let (client, server) = socket_pair();

    server.register_func("foo", |ctx: Context| async move {
        let data: TestData = ctx.decode()?;
        Ok(data)
    });
    server.ready();
    client.ready();

    let reply = client.call("foo", &test_data()).await.unwrap();
    let echoed: TestData = reply.decode().unwrap();
    assert_eq!(echoed, test_data());
}

#[tokio::test]
async fn peer_error_text_is_surfaced() {
    let (client, server) = socket_pair();

    server.register_func("err", |_ctx: Context| async move {
        Err::<(), _>(anyhow::anyhow!("ERROR"))
    });
    server.ready();
    client.ready();

    let err = client.call("err", &()).await.unwrap_err();
    assert_eq!(err.to_string(), "ERROR");
    match err {
        Error::Remote { message, data } => {
            assert_eq!(message, "ERROR");
            // The reply payload travels alongside the error; here it is
            // the encoded nil value.
            assert!(MsgPack.is_empty_value(&data));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn call_times_out_unless_deadline_is_raised() {
    let (client, server) = socket_pair();

    server.register_func("timeout", |_ctx: Context| async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(())
    });
    server.ready();
    client.ready();

    client.set_call_timeout(Duration::from_secs(2));
    let err = client.call("timeout", &()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");

    let reply = client
        .call_with_timeout("timeout", &(), Duration::from_secs(5))
        .await;
    assert!(reply.is_ok(), "got {reply:?}");
}

#[tokio::test]
async fn concurrent_calls_correlate() {
    let (client, server) = socket_pair();

    server.register_func("echo", |ctx: Context| async move {
        let value: u64 = ctx.decode()?;
        Ok(value)
    });
    server.ready();
    client.ready();

    let mut tasks = Vec::new();
    for i in 0..100u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client.call("echo", &i).await.unwrap();
            let echoed: u64 = reply.decode().unwrap();
            assert_eq!(echoed, i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_concurrent_calls() {
    init_logging();
    let (client, server) = socket_pair();

    server.register_func("greet", |ctx: Context| async move {
        let name: String = ctx.decode()?;
        anyhow::ensure!(name == "Greet", "unexpected greeting");
        Ok("Roger".to_string())
    });
    client.register_func("call", |ctx: Context| async move {
        let data: TestData = ctx.decode()?;
        Ok(data)
    });
    client.ready();
    server.ready();

    let mut tasks = Vec::new();
    for _ in 0..10_000 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client.call("greet", &"Greet").await.unwrap();
            let greeting: String = reply.decode().unwrap();
            assert_eq!(greeting, "Roger");
        }));

        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            let reply = server.call("call", &test_data()).await.unwrap();
            let data: TestData = reply.decode().unwrap();
            assert_eq!(data, test_data());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_send() {
    let (client, server) = socket_pair();

    server.register_func("echo", |ctx: Context| async move {
        Ok(ctx.decode::<Vec<u8>>()?)
    });
    server.ready();
    client.ready();

    client.set_max_message_size(4096);
    let big = vec![0u8; 5000];
    let err = client.call("echo", &big).await.unwrap_err();
    assert!(matches!(err, Error::MaxMessageSizeExceeded), "got {err:?}");
    assert!(!client.is_closed());

    // The socket stays usable.
    let small = vec![1u8; 16];
    let reply = client.call("echo", &small).await.unwrap();
    let echoed: Vec<u8> = reply.decode().unwrap();
    assert_eq!(echoed, small);
}

#[tokio::test]
async fn close_unblocks_pending_call() {
    let (client, server) = socket_pair();

    server.register_func("hang", |_ctx: Context| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    });
    server.ready();
    client.ready();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_with_timeout("hang", &(), Duration::from_secs(30))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close();

    let result = timeout(Duration::from_secs(1), caller)
        .await
        .expect("caller unblocked within deadline")
        .unwrap();
    assert!(matches!(result, Err(Error::Closed)), "got {result:?}");
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_peer() {
    let (client, server) = socket_pair();
    server.ready();
    client.ready();

    let hooks = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let hooks = hooks.clone();
        client.on_close(move |_socket| {
            hooks.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(!client.is_closed());
    client.close();
    client.close();
    client.close();
    assert!(client.is_closed());
    assert_eq!(hooks.load(Ordering::SeqCst), 2);

    timeout(Duration::from_secs(1), server.closed().cancelled())
        .await
        .expect("peer observed the close");
    assert!(server.is_closed());
}

#[tokio::test]
async fn on_close_after_close_fires_immediately() {
    let (client, _server) = socket_pair();
    client.ready();
    client.close();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        client.on_close(move |_socket| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn call_after_close_fails_fast() {
    let (client, server) = socket_pair();
    server.ready();
    client.ready();

    client.close();
    let err = client.call("echo", &()).await.unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");
}

#[tokio::test]
async fn panicking_handler_does_not_close_the_socket() {
    init_logging();
    let (client, server) = socket_pair();

    let always = true;
    server.register_func("boom", move |_ctx: Context| async move {
        if always {
            panic!("kaboom");
        }
        Ok(())
    });
    server.register_func("greet", |_ctx: Context| async move {
        Ok("Roger".to_string())
    });
    server.ready();
    client.ready();

    let err = client
        .call_with_timeout("boom", &(), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
    assert!(!server.is_closed());

    let reply = client.call("greet", &()).await.unwrap();
    let greeting: String = reply.decode().unwrap();
    assert_eq!(greeting, "Roger");
}

#[tokio::test]
async fn unknown_function_runs_into_the_call_timeout() {
    let (client, server) = socket_pair();
    server.ready();
    client.ready();

    let err = client
        .call_with_timeout("nope", &(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");
}

#[tokio::test]
async fn empty_payloads_report_no_context_data() {
    let (client, server) = socket_pair();

    server.register_func("check", |ctx: Context| async move {
        match ctx.decode::<TestData>() {
            Err(Error::NoContextData) => Ok("no-data".to_string()),
            Ok(_) => Ok("data".to_string()),
            Err(err) => Err(err.into()),
        }
    });
    server.register_func("nodata", |_ctx: Context| async move { Ok(()) });
    server.ready();
    client.ready();

    let reply = client.call("check", &()).await.unwrap();
    let seen: String = reply.decode().unwrap();
    assert_eq!(seen, "no-data");

    // A unit reply decodes to nothing on the caller side as well.
    let reply = client.call("nodata", &()).await.unwrap();
    assert!(matches!(
        reply.decode::<String>(),
        Err(Error::NoContextData)
    ));
}

#[tokio::test]
async fn call_and_error_hooks_fire() {
    let (client, server) = socket_pair();

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let calls = calls.clone();
        server.set_call_hook(move |_socket, func_id, _ctx| {
            calls.lock().unwrap().push(func_id.to_string());
        });
    }
    {
        let errors = errors.clone();
        server.set_error_hook(move |func_id, err| {
            errors.lock().unwrap().push(format!("{func_id}: {err}"));
        });
    }

    server.register_func("err", |_ctx: Context| async move {
        Err::<(), _>(anyhow::anyhow!("ERROR"))
    });
    server.ready();
    client.ready();

    let err = client.call("err", &()).await.unwrap_err();
    assert_eq!(err.to_string(), "ERROR");

    // The error hook runs after the reply is written; give it a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*calls.lock().unwrap(), vec!["err".to_string()]);
    assert_eq!(*errors.lock().unwrap(), vec!["err: ERROR".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn keep_alive_pings_prevent_idle_close() {
    let (client, server) = socket_pair();
    client.ready();
    server.ready();

    // No calls at all: ping/pong traffic alone must keep both ends alive
    // well past the 45 s idle window.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_triggers_close() {
    // The peer end stays open but never reads or writes.
    let (left, _right) = tokio::io::duplex(64 * 1024);
    let socket = Socket::new(left);
    socket.ready();

    // The read deadline (40 s) fires first on a stalled stream; the idle
    // watcher (45 s) is the backstop.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(socket.is_closed());
}

#[tokio::test]
async fn value_slot_and_identifier() {
    let (left, _right) = tokio::io::duplex(1024);
    let socket = Socket::with_id(left, "test-socket");
    assert_eq!(socket.id(), "test-socket");

    socket.set_value(42u64);
    assert_eq!(socket.value::<u64>().as_deref(), Some(&42));
    assert!(socket.value::<String>().is_none());
}
