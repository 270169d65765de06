// End-to-end scenarios over real TCP sockets: one ephemeral daemon per
// test, driven through the client crate.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use muscle_client::{Client, ClientConfig, SubscribeOptions};
use muscle_wire::{Field, Message};
use reflectd::config::DaemonConfig;
use reflectd::server::Daemon;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> DaemonConfig {
    DaemonConfig {
        bind_addr: "127.0.0.1".parse().expect("addr"),
        port: 0,
        max_bytes_per_session: 4 * 1024 * 1024,
        max_nodes_per_session: 10_000,
        max_message_size: 1024 * 1024,
        privilege: Vec::new(),
        log_level: "info".into(),
        metrics_bind: None,
    }
}

async fn spawn_daemon() -> SocketAddr {
    let daemon = Daemon::bind(test_config()).await.expect("bind");
    let addr = daemon.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = daemon.run().await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    Client::connect(addr, ClientConfig::default())
        .await
        .expect("connect")
}

fn payload(n: i32) -> Message {
    let mut msg = Message::new(1);
    msg.set_field("n", Field::Int32(vec![n]));
    msg
}

fn payload_value(msg: &Message) -> i32 {
    msg.first_i32("n").expect("n")
}

#[tokio::test]
async fn hello_carries_host_and_session_id() {
    let addr = spawn_daemon().await;
    let first = connect(addr).await;
    let second = connect(addr).await;
    assert_eq!(first.server_host(), "127.0.0.1");
    assert_ne!(first.session_id(), second.session_id());
    assert!(first.root_path().starts_with("/127.0.0.1/"));
}

#[tokio::test]
async fn ping_round_trips() {
    let addr = spawn_daemon().await;
    let mut client = connect(addr).await;
    tokio::time::timeout(WAIT, client.ping())
        .await
        .expect("deadline")
        .expect("pong");
}

#[tokio::test]
async fn subscribe_set_update_remove_flow() {
    let addr = spawn_daemon().await;
    let mut watcher = connect(addr).await;
    let mut editor = connect(addr).await;

    watcher
        .subscribe(
            "/*/*/data/*",
            SubscribeOptions {
                include_old: true,
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect("subscribe");
    // Let the subscription land before the first write.
    watcher.ping().await.expect("settle");

    editor.set_data("data/x", payload(1)).await.expect("set");
    let update = tokio::time::timeout(WAIT, watcher.next_update())
        .await
        .expect("deadline")
        .expect("update");
    assert_eq!(update.nodes.len(), 1);
    let node = &update.nodes[0];
    assert!(node.path.ends_with("/data/x"));
    assert_eq!(payload_value(node.payload.as_ref().expect("payload")), 1);
    assert!(node.old_payload.is_none());

    editor.set_data("data/x", payload(2)).await.expect("set 2");
    let update = tokio::time::timeout(WAIT, watcher.next_update())
        .await
        .expect("deadline")
        .expect("update");
    let node = &update.nodes[0];
    assert_eq!(payload_value(node.payload.as_ref().expect("payload")), 2);
    assert_eq!(payload_value(node.old_payload.as_ref().expect("old")), 1);

    editor.remove_data("data").await.expect("remove");
    let update = tokio::time::timeout(WAIT, watcher.next_update())
        .await
        .expect("deadline")
        .expect("update");
    let removed: Vec<&str> = update
        .nodes
        .iter()
        .filter(|n| n.payload.is_none())
        .map(|n| n.path.as_str())
        .collect();
    assert_eq!(removed.len(), 1);
    assert!(removed[0].ends_with("/data/x"));
}

#[tokio::test]
async fn ordered_inserts_use_the_auto_name_counter() {
    let addr = spawn_daemon().await;
    let mut client = connect(addr).await;

    client.set_data("list", Message::default()).await.expect("list");
    for n in 0..3 {
        client
            .insert_ordered("list", None, None, vec![payload(n)])
            .await
            .expect("insert");
    }
    client
        .set_data("list/I5", payload(50))
        .await
        .expect("manual I5");
    client
        .insert_ordered("list", None, None, vec![payload(6)])
        .await
        .expect("insert after I5");

    let mut names: Vec<String> = client
        .get_data("list/*")
        .await
        .expect("get")
        .into_iter()
        .map(|(path, _)| path.rsplit('/').next().expect("name").to_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["I0", "I1", "I2", "I5", "I6"]);
}

#[tokio::test]
async fn quiet_subscriptions_skip_the_snapshot() {
    let addr = spawn_daemon().await;
    let mut watcher = connect(addr).await;
    let mut editor = connect(addr).await;

    editor.set_data("data/x", payload(1)).await.expect("set");
    editor.ping().await.expect("settle");

    watcher
        .subscribe(
            "/*/*/data/*",
            SubscribeOptions {
                quiet: true,
                ..SubscribeOptions::default()
            },
        )
        .await
        .expect("subscribe");
    watcher.ping().await.expect("settle");

    // Nothing buffered: the only thing that can arrive now is the update
    // for a fresh write.
    editor.set_data("data/y", payload(2)).await.expect("set y");
    let update = tokio::time::timeout(WAIT, watcher.next_update())
        .await
        .expect("deadline")
        .expect("update");
    assert_eq!(update.nodes.len(), 1);
    assert!(update.nodes[0].path.ends_with("/data/y"));
}

#[tokio::test]
async fn malformed_patterns_are_rejected_with_an_error_reply() {
    let addr = spawn_daemon().await;
    let mut client = connect(addr).await;
    let err = client.get_data("bad[class").await.expect_err("reject");
    assert!(err.to_string().contains("server rejected request"));
    // The session survives the error.
    client.ping().await.expect("still alive");
}

#[tokio::test]
async fn connect_timeout_reports_failure_promptly() {
    // Reserved TEST-NET-1 address; nothing answers there.
    let addr: SocketAddr = "192.0.2.1:2960".parse().expect("addr");
    let config = ClientConfig {
        connect_timeout: Some(Duration::from_millis(100)),
        ..ClientConfig::default()
    };
    let start = Instant::now();
    let result = Client::connect(addr, config).await;
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn garbage_frames_disconnect_the_session() {
    use tokio::io::AsyncWriteExt;

    let addr = spawn_daemon().await;
    let mut raw = tokio::net::TcpStream::connect(addr).await.expect("connect");
    // Read and discard the hello, then send a frame with a bogus magic.
    let mut hello = [0u8; 256];
    use tokio::io::AsyncReadExt;
    let _ = raw.read(&mut hello).await.expect("hello");
    raw.write_all(&[0xFFu8; 32]).await.expect("garbage");

    // The server faults the gateway and closes; the read eventually sees
    // EOF rather than hanging.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, raw.read(&mut buf))
        .await
        .expect("deadline")
        .expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn two_watchers_both_receive_fanout() {
    let addr = spawn_daemon().await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    let mut editor = connect(addr).await;

    for watcher in [&mut first, &mut second] {
        watcher
            .subscribe("/*/*/shared", SubscribeOptions::default())
            .await
            .expect("subscribe");
        watcher.ping().await.expect("settle");
    }

    editor.set_data("shared", payload(7)).await.expect("set");
    for watcher in [&mut first, &mut second] {
        let update = tokio::time::timeout(WAIT, watcher.next_update())
            .await
            .expect("deadline")
            .expect("update");
        assert!(update.nodes[0].path.ends_with("/shared"));
        assert_eq!(payload_value(update.nodes[0].payload.as_ref().expect("payload")), 7);
    }
}
