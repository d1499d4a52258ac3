//! In-process stand-in for a RESP key-value server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cellar::resp::{Frame, FrameError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    generation: Mutex<CancellationToken>,
    accepted: AtomicUsize,
    password: Option<String>,
    reply_delay: Mutex<Duration>,
}

/// Handle to a running fake server. The server stops when the test's
/// runtime shuts down.
#[derive(Clone)]
pub struct FakeRedis {
    addr: String,
    shared: Arc<Shared>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    pub async fn with_password(password: &str) -> Self {
        Self::start_with(Some(password.to_owned())).await
    }

    async fn start_with(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shared = Arc::new(Shared {
            password,
            ..Shared::default()
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let token = accept_shared.generation.lock().unwrap().clone();
                tokio::spawn(serve(stream, Arc::clone(&accept_shared), token));
            }
        });

        Self { addr, shared }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Closes every open connection; new ones are still accepted.
    pub fn sever_connections(&self) {
        let mut generation = self.shared.generation.lock().unwrap();
        generation.cancel();
        *generation = CancellationToken::new();
    }

    /// Holds every reply back by `delay` before sending it.
    pub fn delay_replies(&self, delay: Duration) {
        *self.shared.reply_delay.lock().unwrap() = delay;
    }

    pub fn raw_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shared
            .data
            .lock()
            .unwrap()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect();
        keys.sort();
        keys
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>, token: CancellationToken) {
    let mut buf = BytesMut::new();
    let mut authed = shared.password.is_none();

    loop {
        match Frame::parse(&buf) {
            Ok((frame, used)) => {
                let _ = buf.split_to(used);
                let reply = execute(&shared, &mut authed, frame);
                let delay = *shared.reply_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if stream.write_all(&reply.to_bytes()).await.is_err() {
                    return;
                }
                continue;
            }
            Err(FrameError::Incomplete) => {}
            Err(_) => return,
        }

        tokio::select! {
            _ = token.cancelled() => return,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

fn execute(shared: &Shared, authed: &mut bool, frame: Frame) -> Frame {
    let Frame::Array(parts) = frame else {
        return Frame::Error("ERR expected array".into());
    };
    let args: Vec<Vec<u8>> = parts
        .iter()
        .map(|p| p.as_bytes().map(<[u8]>::to_vec).unwrap_or_default())
        .collect();
    let Some(name) = args.first() else {
        return Frame::Error("ERR empty command".into());
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();

    if name == "AUTH" {
        let given = args.get(1).map(|p| String::from_utf8_lossy(p).into_owned());
        return if given == shared.password {
            *authed = true;
            Frame::Simple("OK".into())
        } else {
            Frame::Error("WRONGPASS invalid password".into())
        };
    }
    if !*authed {
        return Frame::Error("NOAUTH Authentication required".into());
    }

    let mut data = shared.data.lock().unwrap();
    match name.as_str() {
        "PING" => Frame::Simple("PONG".into()),
        "SET" if args.len() == 3 => {
            data.insert(args[1].clone(), args[2].clone());
            Frame::Simple("OK".into())
        }
        "GET" if args.len() == 2 => match data.get(&args[1]) {
            Some(v) => Frame::Bulk(Bytes::copy_from_slice(v)),
            None => Frame::Null,
        },
        "EXISTS" => Frame::Integer(args[1..].iter().filter(|k| data.contains_key(*k)).count() as i64),
        "DEL" => Frame::Integer(args[1..].iter().filter(|k| data.remove(*k).is_some()).count() as i64),
        "SCAN" => {
            let pattern = args
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"MATCH"))
                .and_then(|i| args.get(i + 1))
                .cloned()
                .unwrap_or_else(|| b"*".to_vec());
            let keys = data
                .keys()
                .filter(|k| glob_match(&pattern, k))
                .map(|k| Frame::Bulk(Bytes::copy_from_slice(k)))
                .collect();
            Frame::Array(vec![Frame::Bulk(Bytes::from_static(b"0")), Frame::Array(keys)])
        }
        _ => Frame::Error(format!("ERR unknown command '{name}'")),
    }
}

/// `*`, `?` and backslash escapes; enough for prefix scans.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}
