//! RESP2 client for Redis-compatible stores.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

use super::{CommandExecutor, StoreError};
use crate::catalog::CommandDescriptor;

const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Frame>),
    Null,
}

impl Frame {
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Simple(s) => Some(s.clone()),
            Self::Bulk(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = StoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, StoreError> {
        match parse_frame(src, 0)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Encodes a command as an array of bulk strings.
impl Encoder<Vec<Bytes>> for RespCodec {
    type Error = StoreError;

    fn encode(&mut self, parts: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), StoreError> {
        dst.put_u8(b'*');
        dst.put_slice(parts.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for part in parts {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(&part);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            StoreError::Protocol(format!(
                "invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Parse one frame starting at `pos`. `Ok(None)` means more bytes are needed.
fn parse_frame(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, StoreError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((
            Frame::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(StoreError::Protocol(format!("bulk length {len} too large")));
            }
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            if &buf[next + len..next + len + 2] != b"\r\n" {
                return Err(StoreError::Protocol("bulk not terminated by CRLF".into()));
            }
            let data = Bytes::copy_from_slice(&buf[next..next + len]);
            Ok(Some((Frame::Bulk(data), next + len + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse_frame(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), cursor)))
        }
        other => Err(StoreError::Protocol(format!(
            "unknown frame type byte 0x{other:02x}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub addr: String,
    pub password: Option<String>,
    pub db: u32,
    pub pool_size: usize,
    pub timeout: Duration,
}

type Connection = Framed<TcpStream, RespCodec>;

/// A fixed set of lazily-opened connections used round-robin. A connection
/// that hits an I/O error or a timeout is discarded and reopened on next use.
pub struct RedisStore {
    opts: RedisOptions,
    slots: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
}

impl RedisStore {
    pub fn new(opts: RedisOptions) -> Self {
        let slots = (0..opts.pool_size.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            opts,
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Open one connection eagerly so that a misconfigured store fails startup.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self.call(vec![Bytes::from_static(b"PING")]).await? {
            Frame::Simple(s) if s.eq_ignore_ascii_case("pong") => Ok(()),
            other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    async fn connect(&self) -> Result<Connection, StoreError> {
        let stream = tokio::time::timeout(self.opts.timeout, TcpStream::connect(&self.opts.addr))
            .await
            .map_err(|_| StoreError::Timeout)??;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, RespCodec);

        if let Some(password) = &self.opts.password {
            let auth = vec![
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(password.as_bytes()),
            ];
            expect_ok(roundtrip(&mut conn, auth).await?)?;
        }
        if self.opts.db != 0 {
            let select = vec![
                Bytes::from_static(b"SELECT"),
                Bytes::from(self.opts.db.to_string()),
            ];
            expect_ok(roundtrip(&mut conn, select).await?)?;
        }
        debug!(addr = %self.opts.addr, db = self.opts.db, "store connection opened");
        Ok(conn)
    }

    async fn call(&self, parts: Vec<Bytes>) -> Result<Frame, StoreError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[idx].lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(StoreError::ConnectionClosed);
        };

        let outcome = tokio::time::timeout(self.opts.timeout, roundtrip(conn, parts)).await;
        match outcome {
            Ok(Ok(Frame::Error(msg))) => Err(StoreError::Command(msg)),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(err)) => {
                warn!(addr = %self.opts.addr, error = %err, "dropping store connection");
                *slot = None;
                Err(err)
            }
            Err(_) => {
                *slot = None;
                Err(StoreError::Timeout)
            }
        }
    }
}

async fn roundtrip(conn: &mut Connection, parts: Vec<Bytes>) -> Result<Frame, StoreError> {
    conn.send(parts).await?;
    conn.next().await.ok_or(StoreError::ConnectionClosed)?
}

fn expect_ok(frame: Frame) -> Result<(), StoreError> {
    match frame {
        Frame::Simple(_) => Ok(()),
        Frame::Error(msg) => Err(StoreError::Command(msg)),
        other => Err(StoreError::UnexpectedReply(format!("{other:?}"))),
    }
}

/// Map one `COMMAND` entry: `[name, arity, flags, first_key, last_key, step, ...]`.
fn descriptor_from_entry(entry: &Frame) -> Option<CommandDescriptor> {
    let Frame::Array(fields) = entry else {
        return None;
    };
    let name = fields.first()?.as_text()?;
    let arity = fields.get(1)?.as_integer()?;
    let first_key = fields.get(3)?.as_integer()?;
    Some(CommandDescriptor::new(
        name,
        arity,
        usize::try_from(first_key).unwrap_or(0),
    ))
}

#[async_trait]
impl CommandExecutor for RedisStore {
    async fn execute(&self, command: &str, args: &[Bytes]) -> Result<Frame, StoreError> {
        let mut parts = Vec::with_capacity(args.len() + 1);
        parts.push(Bytes::copy_from_slice(command.as_bytes()));
        parts.extend(args.iter().cloned());
        self.call(parts).await
    }

    async fn introspect_commands(&self) -> Result<Vec<CommandDescriptor>, StoreError> {
        let reply = self.call(vec![Bytes::from_static(b"COMMAND")]).await?;
        let Frame::Array(entries) = reply else {
            return Err(StoreError::UnexpectedReply(format!("{reply:?}")));
        };
        Ok(entries.iter().filter_map(descriptor_from_entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn decode_all(input: &[u8]) -> Result<Option<Frame>, StoreError> {
        let mut buf = BytesMut::from(input);
        RespCodec.decode(&mut buf)
    }

    #[test]
    fn decodes_scalar_frames() {
        assert_eq!(
            decode_all(b"+OK\r\n").unwrap(),
            Some(Frame::Simple("OK".into()))
        );
        assert_eq!(
            decode_all(b"-ERR wrong type\r\n").unwrap(),
            Some(Frame::Error("ERR wrong type".into()))
        );
        assert_eq!(decode_all(b":-7\r\n").unwrap(), Some(Frame::Integer(-7)));
        assert_eq!(
            decode_all(b"$5\r\nhe\r\no\r\n").unwrap(),
            Some(Frame::Bulk(Bytes::from_static(b"he\r\no")))
        );
        assert_eq!(decode_all(b"$-1\r\n").unwrap(), Some(Frame::Null));
    }

    #[test]
    fn waits_for_incomplete_input_without_consuming() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n$3\r\nba"[..]);
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 20);

        buf.extend_from_slice(b"r\r\n+extra\r\n");
        assert_eq!(
            RespCodec.decode(&mut buf).unwrap(),
            Some(Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"foo")),
                Frame::Bulk(Bytes::from_static(b"bar")),
            ]))
        );
        assert_eq!(&buf[..], b"+extra\r\n");
    }

    #[test]
    fn rejects_unknown_type_byte() {
        assert!(matches!(
            decode_all(b"?what\r\n"),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let mut dst = BytesMut::new();
        RespCodec
            .encode(
                vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k1"), Bytes::new()],
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$0\r\n\r\n");
    }

    #[test]
    fn maps_command_table_entries() {
        let entry = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"setex")),
            Frame::Integer(4),
            Frame::Array(vec![Frame::Simple("write".into())]),
            Frame::Integer(1),
            Frame::Integer(1),
            Frame::Integer(1),
        ]);
        assert_eq!(
            descriptor_from_entry(&entry),
            Some(CommandDescriptor::new("setex", 4, 1))
        );
        assert_eq!(descriptor_from_entry(&Frame::Integer(1)), None);
    }

    /// Minimal single-connection RESP responder: answers each request with
    /// the next canned reply.
    async fn spawn_fake_store(
        replies: Vec<&'static [u8]>,
    ) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = BytesMut::new();
            for reply in replies {
                loop {
                    let mut probe = buf.clone();
                    if RespCodec.decode(&mut probe).unwrap().is_some() {
                        let consumed = buf.len() - probe.len();
                        seen.extend_from_slice(&buf.split_to(consumed));
                        break;
                    }
                    let mut chunk = [0u8; 1024];
                    let n = sock.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return seen;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                sock.write_all(reply).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    fn opts(addr: String) -> RedisOptions {
        RedisOptions {
            addr,
            password: Some("secret".into()),
            db: 2,
            pool_size: 1,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn authenticates_selects_and_executes() {
        let (addr, server) =
            spawn_fake_store(vec![
                b"+OK\r\n".as_slice(),
                b"+OK\r\n".as_slice(),
                b"+OK\r\n".as_slice(),
                b"-ERR boom\r\n".as_slice(),
            ])
            .await;
        let store = RedisStore::new(opts(addr));

        let reply = store
            .execute("set", &[Bytes::from_static(b"k1"), Bytes::from_static(b"v1")])
            .await
            .unwrap();
        assert_eq!(reply, Frame::Simple("OK".into()));

        let err = store
            .execute("set", &[Bytes::from_static(b"k1"), Bytes::from_static(b"v2")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Command(msg) if msg == "ERR boom"));

        drop(store);
        let seen = server.await.unwrap();
        let seen = String::from_utf8(seen).unwrap();
        assert!(seen.starts_with("*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n*2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n"));
        assert!(seen.ends_with("*3\r\n$3\r\nset\r\n$2\r\nk1\r\n$2\r\nv2\r\n"));
    }

    #[tokio::test]
    async fn introspects_command_table() {
        let table: &'static [u8] = b"*2\r\n*6\r\n$3\r\nset\r\n:-3\r\n*0\r\n:1\r\n:1\r\n:1\r\n*6\r\n$4\r\nping\r\n:-1\r\n*0\r\n:0\r\n:0\r\n:0\r\n";
        let (addr, _server) = spawn_fake_store(vec![table]).await;
        let store = RedisStore::new(RedisOptions {
            password: None,
            db: 0,
            ..opts(addr)
        });
        let mut table = store.introspect_commands().await.unwrap();
        table.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            table,
            vec![
                CommandDescriptor::new("ping", -1, 0),
                CommandDescriptor::new("set", -3, 1),
            ]
        );
    }
}
