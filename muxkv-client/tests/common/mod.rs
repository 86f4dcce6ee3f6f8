//! In-process fake RESP server and status helpers shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use muxkv_client::{ClientConfig, StatusEvent, StatusHandler};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Handle to a running fake server.
pub struct FakeServer {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
}

impl FakeServer {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn config(&self, connections: usize) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", self.port);
        config.connections = connections;
        config.dial_attempts = 3;
        config.dial_retry_delay = Duration::from_millis(20);
        config.write_timeout = Duration::from_secs(1);
        config
    }
}

/// Starts a server; with `close_after`, each connection is closed once it
/// has answered that many commands.
pub async fn spawn_server(close_after: Option<usize>) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(Mutex::new(HashMap::<Vec<u8>, Vec<u8>>::new()));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let store = store.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let mut served = 0;
                while let Ok(Some(args)) = read_command(&mut reader).await {
                    let quit = handle(&args, &store, &mut write).await;
                    served += 1;
                    if quit || close_after.is_some_and(|limit| served >= limit) {
                        break;
                    }
                }
                let _ = write.shutdown().await;
            });
        }
    });

    FakeServer { port, accepted }
}

/// Returns a port nothing listens on.
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

async fn handle(args: &[Vec<u8>], store: &Mutex<HashMap<Vec<u8>, Vec<u8>>>, out: &mut OwnedWriteHalf) -> bool {
    let name = args[0].to_ascii_uppercase();
    let reply = match (name.as_slice(), args.len()) {
        (b"PING", 1) => b"+PONG\r\n".to_vec(),
        (b"ECHO", 2) => bulk(&args[1]),
        (b"SET", 3) => {
            store.lock().unwrap().insert(args[1].clone(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        (b"GET", 2) => match store.lock().unwrap().get(&args[1]) {
            Some(value) => bulk(value),
            None => b"$-1\r\n".to_vec(),
        },
        (b"INCR", 2) => {
            let mut store = store.lock().unwrap();
            let current = store.get(&args[1]).cloned().unwrap_or_else(|| b"0".to_vec());
            match std::str::from_utf8(&current).ok().and_then(|text| text.parse::<i64>().ok()) {
                Some(value) => {
                    store.insert(args[1].clone(), (value + 1).to_string().into_bytes());
                    format!(":{}\r\n", value + 1).into_bytes()
                }
                None => b"-ERR value is not an integer or out of range\r\n".to_vec(),
            }
        }
        (b"DEL", _) => {
            let mut store = store.lock().unwrap();
            let removed = args[1..].iter().filter(|key| store.remove(*key).is_some()).count();
            format!(":{}\r\n", removed).into_bytes()
        }
        (b"QUIT", 1) => {
            let _ = out.write_all(b"+OK\r\n").await;
            return true;
        }
        _ => format!("-ERR unknown command '{}'\r\n", String::from_utf8_lossy(&args[0])).into_bytes(),
    };
    let _ = out.write_all(&reply).await;
    false
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

async fn read_command<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Vec<Vec<u8>>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = Vec::new();
    if !read_line(reader, &mut line).await? {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if !read_line(reader, &mut line).await? {
            return Ok(None);
        }
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

async fn read_line<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: tokio::io::AsyncRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(true)
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("length"))
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

/// Status handler forwarding every event into a channel.
pub fn status_channel() -> (StatusHandler, mpsc::UnboundedReceiver<StatusEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: StatusHandler = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

/// Waits for the first event matching `pred`, skipping others.
pub async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<StatusEvent>, mut pred: F) -> Option<StatusEvent>
where
    F: FnMut(&StatusEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
