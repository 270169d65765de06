// TCP client for the message-reflection protocol.
//
// One `Client` owns one connection.  Requests that expect a direct reply
// carry a `_tag` field the server echoes; subscription updates arrive
// untagged and are buffered until the caller asks for them.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use muscle_wire::protocol::{self, field_names, parse_update, TreeUpdate};
use muscle_wire::{frame, Field, FrameHeader, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the TCP connect; `None` means never time out.
    pub connect_timeout: Option<Duration>,
    /// Largest frame body this client will accept.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(20)),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Suppress the initial bulk snapshot.
    pub quiet: bool,
    /// Ask for old payloads alongside changed data.
    pub include_old: bool,
    /// Let the server coalesce (drop oldest) instead of disconnecting when
    /// this session falls behind.
    pub coalesce: Option<bool>,
    /// Cap on update items per second.
    pub rate: Option<i32>,
}

pub struct Client {
    stream: TcpStream,
    scratch: BytesMut,
    config: ClientConfig,
    session_id: u32,
    server_host: String,
    updates: VecDeque<TreeUpdate>,
    next_tag: i32,
}

impl Client {
    /// Connects, honoring the configured deadline, and completes the hello
    /// handshake.  On timeout the socket is dropped and an error returned;
    /// no half-open session is left behind.
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let connect = TcpStream::connect(addr);
        let stream = match config.connect_timeout {
            Some(deadline) => tokio::time::timeout(deadline, connect)
                .await
                .map_err(|_| anyhow::anyhow!("connect to {addr} timed out after {deadline:?}"))?
                .with_context(|| format!("connect to {addr}"))?,
            None => connect.await.with_context(|| format!("connect to {addr}"))?,
        };
        stream.set_nodelay(true).context("set TCP_NODELAY")?;

        let mut client = Self {
            stream,
            scratch: BytesMut::new(),
            config,
            session_id: 0,
            server_host: String::new(),
            updates: VecDeque::new(),
            next_tag: 1,
        };
        let hello = client
            .recv()
            .await?
            .context("server closed before hello")?;
        if hello.what != protocol::RES_HELLO {
            bail!("expected hello, got what-code {:#010x}", hello.what);
        }
        client.server_host = hello
            .first_string(field_names::HOST)
            .context("hello host field")?
            .to_owned();
        client.session_id = hello
            .first_i32(field_names::SESSION)
            .context("hello session field")? as u32;
        tracing::debug!(
            session = client.session_id,
            host = %client.server_host,
            "connected"
        );
        Ok(client)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn server_host(&self) -> &str {
        &self.server_host
    }

    /// Absolute path of this session's subtree root.
    pub fn root_path(&self) -> String {
        format!("/{}/{:010}", self.server_host, self.session_id)
    }

    /// Stores a payload at a path relative to the session subtree, creating
    /// intermediate nodes as needed.
    pub async fn set_data(&mut self, path: &str, payload: Message) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_SET_DATA);
        msg.set_field(path, Field::Message(vec![payload]));
        self.send(&msg).await
    }

    /// Fetches every node matching the pattern, as `(path, payload)` pairs.
    pub async fn get_data(&mut self, pattern: &str) -> Result<Vec<(String, Message)>> {
        let tag = self.take_tag();
        let mut msg = Message::new(protocol::CMD_GET_DATA);
        msg.set_field(field_names::PATHS, Field::String(vec![pattern.to_owned()]));
        msg.set_field(field_names::TAG, Field::Int32(vec![tag]));
        self.send(&msg).await?;
        let reply = self.await_tagged(tag).await?;
        let update = parse_update(&reply).context("parse get-data reply")?;
        Ok(update
            .nodes
            .into_iter()
            .filter_map(|n| n.payload.map(|p| (n.path, p)))
            .collect())
    }

    pub async fn remove_data(&mut self, pattern: &str) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_REMOVE_DATA);
        msg.set_field(field_names::PATHS, Field::String(vec![pattern.to_owned()]));
        self.send(&msg).await
    }

    pub async fn subscribe(&mut self, pattern: &str, options: SubscribeOptions) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_SUBSCRIBE);
        msg.set_field(field_names::PATHS, Field::String(vec![pattern.to_owned()]));
        if options.quiet {
            msg.set_field(field_names::QUIET, Field::Bool(vec![true]));
        }
        if options.include_old {
            msg.set_field(field_names::OLD, Field::Bool(vec![true]));
        }
        if let Some(coalesce) = options.coalesce {
            msg.set_field(field_names::COALESCE, Field::Bool(vec![coalesce]));
        }
        if let Some(rate) = options.rate {
            msg.set_field(field_names::RATE, Field::Int32(vec![rate]));
        }
        self.send(&msg).await
    }

    pub async fn unsubscribe(&mut self, pattern: &str) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_UNSUBSCRIBE);
        msg.set_field(field_names::PATHS, Field::String(vec![pattern.to_owned()]));
        self.send(&msg).await
    }

    /// Inserts payloads as ordered children of `path`.  With a single
    /// payload an explicit `name` may be given; otherwise names are
    /// auto-generated on the server.
    pub async fn insert_ordered(
        &mut self,
        path: &str,
        name: Option<&str>,
        before: Option<&str>,
        payloads: Vec<Message>,
    ) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_INSERT_ORDERED);
        msg.set_field(field_names::PATH, Field::String(vec![path.to_owned()]));
        msg.set_field(field_names::PAYLOAD, Field::Message(payloads));
        if let Some(name) = name {
            msg.set_field(field_names::NAME, Field::String(vec![name.to_owned()]));
        }
        if let Some(before) = before {
            msg.set_field(field_names::BEFORE, Field::String(vec![before.to_owned()]));
        }
        self.send(&msg).await
    }

    /// Moves the indexed child at `path` to just before `before`, or to the
    /// end of the index.
    pub async fn reorder(&mut self, path: &str, before: Option<&str>) -> Result<()> {
        let mut msg = Message::new(protocol::CMD_REORDER_INDEX);
        msg.set_field(field_names::PATH, Field::String(vec![path.to_owned()]));
        if let Some(before) = before {
            msg.set_field(field_names::BEFORE, Field::String(vec![before.to_owned()]));
        }
        self.send(&msg).await
    }

    /// Round-trips a ping through the server.
    pub async fn ping(&mut self) -> Result<()> {
        let tag = self.take_tag();
        let mut msg = Message::new(protocol::CMD_PING);
        msg.set_field(field_names::TAG, Field::Int32(vec![tag]));
        self.send(&msg).await?;
        let reply = self.await_tagged(tag).await?;
        if reply.what != protocol::RES_PONG {
            bail!("expected pong, got what-code {:#010x}", reply.what);
        }
        Ok(())
    }

    /// Next subscription update, from the buffer or the wire.
    pub async fn next_update(&mut self) -> Result<TreeUpdate> {
        loop {
            if let Some(update) = self.updates.pop_front() {
                return Ok(update);
            }
            let msg = self
                .recv()
                .await?
                .context("connection closed while waiting for updates")?;
            self.absorb(msg)?;
        }
    }

    fn take_tag(&mut self) -> i32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    // Reads until a message carrying `tag` arrives, buffering updates seen
    // along the way.  Tagged errors become Err; untagged errors are logged
    // and skipped.
    async fn await_tagged(&mut self, tag: i32) -> Result<Message> {
        loop {
            let msg = self
                .recv()
                .await?
                .context("connection closed while waiting for a reply")?;
            if msg.first_i32(field_names::TAG).ok() == Some(tag) {
                if msg.what == protocol::RES_ERROR {
                    let text = msg
                        .first_string(field_names::ERROR)
                        .unwrap_or("unspecified error");
                    let code = msg.first_i32(field_names::CODE).unwrap_or(-1);
                    bail!("server rejected request (code {code}): {text}");
                }
                return Ok(msg);
            }
            self.absorb(msg)?;
        }
    }

    fn absorb(&mut self, msg: Message) -> Result<()> {
        match msg.what {
            protocol::RES_DATA_ITEMS => {
                let update = parse_update(&msg).context("parse update")?;
                self.updates.push_back(update);
            }
            protocol::RES_ERROR => {
                tracing::warn!(
                    error = msg.first_string(field_names::ERROR).unwrap_or("unknown"),
                    "server reported an error"
                );
            }
            other => {
                tracing::debug!(what = format_args!("{other:#010x}"), "ignoring message");
            }
        }
        Ok(())
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.stream
            .write_all(&frame::encode_frame(msg))
            .await
            .context("write frame")
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        let mut header_bytes = [0u8; FrameHeader::LEN];
        match self.stream.read_exact(&mut header_bytes).await {
            Ok(_) => {}
            // A clean close at a frame boundary is an orderly shutdown.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err).context("read frame header"),
        }
        let header = FrameHeader::decode(&header_bytes).context("decode frame header")?;
        let body_len = header
            .check_body_len(self.config.max_message_size)
            .context("frame body size")?;
        self.scratch.clear();
        self.scratch.resize(body_len, 0);
        self.stream
            .read_exact(&mut self.scratch[..])
            .await
            .context("read frame body")?;
        let msg = Message::unflatten(&self.scratch).context("decode message")?;
        Ok(Some(msg))
    }
}
