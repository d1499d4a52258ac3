use tracing::debug;

use super::{CacheError, Namespace};
use crate::pool::{Connection, ConnectionError, Pool, Pooled, RedisManager};
use crate::resp::Frame;

// Keys requested per SCAN round trip and deleted per DEL.
const SCAN_COUNT: &str = "100";
const DEL_BATCH: usize = 100;

/// Cache backend over a pooled remote key-value service.
#[derive(Debug, Clone)]
pub struct RemoteCache {
    pool: Pool<RedisManager>,
    ns: Namespace,
}

impl RemoteCache {
    pub fn new(pool: Pool<RedisManager>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            ns: Namespace::new(prefix),
        }
    }

    pub fn pool(&self) -> &Pool<RedisManager> {
        &self.pool
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub(crate) async fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let full = self.ns.key(key);
        match self.command(&[b"SET".as_slice(), full.as_bytes(), value]).await? {
            Frame::Simple(s) if s == "OK" => Ok(()),
            reply => Err(unexpected("SET", reply)),
        }
    }

    pub(crate) async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let full = self.ns.key(key);
        match self.command(&[b"GET".as_slice(), full.as_bytes()]).await? {
            Frame::Bulk(data) => Ok(Some(data.to_vec())),
            Frame::Null => Ok(None),
            reply => Err(unexpected("GET", reply)),
        }
    }

    pub(crate) async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let full = self.ns.key(key);
        match self.command(&[b"EXISTS".as_slice(), full.as_bytes()]).await? {
            Frame::Integer(n) => Ok(n > 0),
            reply => Err(unexpected("EXISTS", reply)),
        }
    }

    pub(crate) async fn forget(&self, key: &str) -> Result<(), CacheError> {
        let full = self.ns.key(key);
        match self.command(&[b"DEL".as_slice(), full.as_bytes()]).await? {
            Frame::Integer(_) => Ok(()),
            reply => Err(unexpected("DEL", reply)),
        }
    }

    pub(crate) async fn empty(&self) -> Result<(), CacheError> {
        self.empty_by_match("").await
    }

    pub(crate) async fn empty_by_match(&self, prefix: &str) -> Result<(), CacheError> {
        let pattern = format!("{}*", escape_glob(&self.ns.key(prefix)));
        let mut conn = self.pool.get().await?;
        conn.discard();
        let result = delete_matching(&mut conn, &pattern).await;
        let removed = settle(&mut conn, result)?;
        debug!(pattern = %pattern, removed, "emptied remote cache");
        Ok(())
    }

    async fn command(&self, args: &[&[u8]]) -> Result<Frame, CacheError> {
        let mut conn = self.pool.get().await?;
        conn.discard();
        let reply = conn.command(args).await;
        Ok(settle(&mut conn, reply)?)
    }
}

// The connection is marked broken for the length of an exchange. Only a
// complete reply (including an error reply) makes it reusable; transport
// failures and exchanges dropped halfway leave the stream out of step.
fn settle<T>(
    conn: &mut Pooled<RedisManager>,
    result: Result<T, ConnectionError>,
) -> Result<T, ConnectionError> {
    if matches!(result, Ok(_) | Err(ConnectionError::Server(_))) {
        conn.retain();
    }
    result
}

fn unexpected(command: &'static str, reply: Frame) -> CacheError {
    CacheError::Remote(ConnectionError::UnexpectedReply { command, reply })
}

async fn delete_matching(conn: &mut Connection, pattern: &str) -> Result<usize, ConnectionError> {
    let mut cursor = b"0".to_vec();
    let mut removed = 0;

    loop {
        let scan: [&[u8]; 6] = [
            b"SCAN",
            &cursor,
            b"MATCH",
            pattern.as_bytes(),
            b"COUNT",
            SCAN_COUNT.as_bytes(),
        ];
        let reply = conn.command(&scan).await?;
        let (next, keys) = parse_scan_reply(reply)?;

        for batch in keys.chunks(DEL_BATCH) {
            let mut args: Vec<&[u8]> = Vec::with_capacity(batch.len() + 1);
            args.push(b"DEL");
            args.extend(batch.iter().map(Vec::as_slice));
            if let Frame::Integer(n) = conn.command(&args[..]).await? {
                removed += usize::try_from(n).unwrap_or(0);
            }
        }

        if next == b"0" {
            return Ok(removed);
        }
        cursor = next;
    }
}

fn parse_scan_reply(reply: Frame) -> Result<(Vec<u8>, Vec<Vec<u8>>), ConnectionError> {
    let malformed = |reply| ConnectionError::UnexpectedReply {
        command: "SCAN",
        reply,
    };
    let mut parts = match reply {
        Frame::Array(parts) => parts,
        other => return Err(malformed(other)),
    };
    if parts.len() != 2 {
        return Err(malformed(Frame::Array(parts)));
    }
    let keys = parts.pop();
    let cursor = parts.pop();

    match (cursor, keys) {
        (Some(Frame::Bulk(cursor)), Some(Frame::Array(keys))) => {
            let keys = keys
                .into_iter()
                .filter_map(|k| match k {
                    Frame::Bulk(k) => Some(k.to_vec()),
                    _ => None,
                })
                .collect();
            Ok((cursor.to_vec(), keys))
        }
        (cursor, keys) => Err(malformed(Frame::Array(
            cursor.into_iter().chain(keys).collect(),
        ))),
    }
}

/// Escapes glob metacharacters so `s` matches itself literally in `MATCH`.
pub(crate) fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
