mod common;

use std::sync::Arc;
use std::time::Duration;

use muxkv_client::{args, cmd, ClientConfig, ClientError, Job, MuxClient, Reply, StatusEvent, SyncedClient};
use tokio::time::sleep;

use common::{dead_port, spawn_server, status_channel, wait_for};

#[tokio::test]
async fn mux_pipeline_replies_in_order() {
    let server = spawn_server(None).await;
    let client = MuxClient::connect(server.config(1), None).await.expect("connect");

    let replies = client
        .commands(args![&cmd::SET, "k", 1, &cmd::INCR, "k", &cmd::GET, "k"])
        .await
        .expect("pipeline");
    assert_eq!(
        replies,
        vec![
            Reply::SimpleString(b"OK".to_vec()),
            Reply::Integer(b"2".to_vec()),
            Reply::BulkString(b"2".to_vec()),
        ]
    );

    let missing = client.command(&cmd::GET, args!["nope"]).await.expect("get");
    assert!(missing.is_nil());
    client.quit().await.expect("quit");
}

#[tokio::test]
async fn mux_server_error_stays_a_reply() {
    let server = spawn_server(None).await;
    let client = MuxClient::connect(server.config(1), None).await.expect("connect");

    client.command(&cmd::SET, args!["word", "abc"]).await.expect("set");
    let job = client
        .execute(Job::pipeline(args![&cmd::INCR, "word", &cmd::PING]).expect("job"))
        .await;
    assert!(job.error().is_none());
    assert!(matches!(job.replies()[0], Reply::Error(_)));
    assert_eq!(job.replies()[1], Reply::SimpleString(b"PONG".to_vec()));
    assert!(matches!(job.first_server_error(), Some(ClientError::Server(_))));
    client.quit().await.expect("quit");
}

#[tokio::test]
async fn mux_concurrent_callers_get_their_own_replies() {
    let server = spawn_server(None).await;
    let client = Arc::new(MuxClient::connect(server.config(3), None).await.expect("connect"));
    assert_eq!(client.connections(), 3);

    let mut tasks = Vec::new();
    for caller in 0..32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..20 {
                let text = format!("caller-{}-{}", caller, round);
                let reply = client.command(&cmd::ECHO, args![text.as_str()]).await.expect("echo");
                assert_eq!(reply.to_text().expect("text"), text);
                client.command(&cmd::INCR, args!["hits"]).await.expect("incr");
            }
        }));
    }
    for task in tasks {
        task.await.expect("caller");
    }

    let hits = client.command(&cmd::GET, args!["hits"]).await.expect("get");
    assert_eq!(hits.to_i64().expect("int"), 32 * 20);
    client.quit().await.expect("quit");
}

#[tokio::test]
async fn mux_quit_twice_and_use_after_quit() {
    let server = spawn_server(None).await;
    let (handler, mut events) = status_channel();
    let client = MuxClient::connect(server.config(2), Some(handler)).await.expect("connect");

    client.quit().await.expect("quit");
    assert!(matches!(client.quit().await, Err(ClientError::AlreadyQuit)));
    assert!(matches!(
        client.command(&cmd::PING, args![]).await,
        Err(ClientError::AlreadyClosed)
    ));

    assert!(wait_for(&mut events, |event| matches!(event, StatusEvent::QuitStarted)).await.is_some());
    assert!(wait_for(&mut events, |event| matches!(event, StatusEvent::QuitDone)).await.is_some());
}

#[tokio::test]
async fn mux_reconnects_after_server_drops_connection() {
    let server = spawn_server(Some(1)).await;
    let (handler, mut events) = status_channel();
    let client = MuxClient::connect(server.config(1), Some(handler)).await.expect("connect");

    client.command(&cmd::SET, args!["k", "v"]).await.expect("first command");
    sleep(Duration::from_millis(100)).await;

    // The job in flight when the socket died may fail; a later one must not.
    let mut recovered = None;
    for _ in 0..3 {
        if let Ok(reply) = client.command(&cmd::GET, args!["k"]).await {
            recovered = Some(reply);
            break;
        }
    }
    assert_eq!(recovered, Some(Reply::BulkString(b"v".to_vec())));
    assert!(server.accepted() >= 2);
    assert!(wait_for(&mut events, |event| matches!(event, StatusEvent::Reconnected { conn: 0 }))
        .await
        .is_some());
    client.quit().await.expect("quit");
}

#[tokio::test]
async fn mux_connect_failure_is_reported() {
    let mut config = ClientConfig::new("127.0.0.1", dead_port());
    config.dial_attempts = 2;
    config.dial_retry_delay = Duration::from_millis(10);
    match MuxClient::connect(config, None).await {
        Err(ClientError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn synced_client_runs_commands_one_at_a_time() {
    let server = spawn_server(None).await;
    let mut client = SyncedClient::connect(server.config(1), None).await.expect("connect");

    let reply = client.command(&cmd::SET, args!["k", 41]).await.expect("set");
    assert_eq!(reply.to_text().expect("text"), "OK");
    let replies = client
        .commands(args![&cmd::INCR, "k", &cmd::DEL, "k", &cmd::GET, "k"])
        .await
        .expect("pipeline");
    assert_eq!(replies[0].to_i64().expect("int"), 42);
    assert_eq!(replies[1].to_i64().expect("int"), 1);
    assert!(replies[2].is_nil());

    let unknown = client.command(&cmd::Cmd::new("FLUSHALL"), args![]).await.expect("reply");
    assert!(unknown.server_error().is_some());

    client.quit().await.expect("quit");
    assert!(matches!(client.quit().await, Err(ClientError::AlreadyQuit)));
    assert!(matches!(
        client.command(&cmd::PING, args![]).await,
        Err(ClientError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn synced_client_redials_after_server_close() {
    let server = spawn_server(Some(1)).await;
    let mut client = SyncedClient::connect(server.config(1), None).await.expect("connect");

    client.command(&cmd::PING, args![]).await.expect("first");
    sleep(Duration::from_millis(100)).await;

    let mut recovered = false;
    for _ in 0..3 {
        match client.command(&cmd::PING, args![]).await {
            Ok(reply) => {
                assert_eq!(reply.to_text().expect("text"), "PONG");
                recovered = true;
                break;
            }
            Err(err) => assert!(matches!(err, ClientError::Read { .. } | ClientError::NothingSent(_))),
        }
    }
    assert!(recovered);
    assert!(server.accepted() >= 2);
}

#[tokio::test]
async fn invalid_batches_never_reach_the_wire() {
    let server = spawn_server(None).await;
    let client = MuxClient::connect(server.config(1), None).await.expect("connect");

    assert!(matches!(client.commands(args![]).await, Err(ClientError::Input(_))));
    assert!(matches!(client.commands(args!["k", &cmd::GET]).await, Err(ClientError::Input(_))));
    assert!(matches!(
        client.command(&cmd::GET, args![&cmd::SET]).await,
        Err(ClientError::Input(_))
    ));
    client.quit().await.expect("quit");
}
