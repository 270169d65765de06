// The daemon's runtime shape: a TCP accept loop, per-connection socket
// tasks, and one dedicated reflect thread that owns every piece of shared
// state.
//
// The reflect thread is the cooperative event loop: it drains a command
// queue, runs tree mutations and subscription fanout to completion, and
// sleeps until the earliest pending pulse.  Socket tasks only decode and
// encode frames; the bounded per-session outgoing channels are the wire
// backpressure boundary.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use muscle_reflect::{ReflectServer, ServerConfig};
use muscle_wire::{protocol, Message};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DaemonConfig;
use crate::gateway;

// Depth of each session's wire-level outgoing channel.
const OUT_QUEUE_DEPTH: usize = 64;
// How long the reflect thread sleeps when no pulse is scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(500);

enum LoopCommand {
    Attach {
        remote_ip: String,
        out_tx: mpsc::Sender<Message>,
        cancel_tx: watch::Sender<bool>,
        reply: oneshot::Sender<std::result::Result<u32, (i32, String)>>,
    },
    Inbound {
        session_id: u32,
        msg: Message,
    },
    Detach {
        session_id: u32,
    },
}

pub struct Daemon {
    listener: TcpListener,
    config: DaemonConfig,
}

impl Daemon {
    /// Binds the listen socket.  A bind failure here is what turns into the
    /// daemon's non-zero exit.
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_addr, config.port))
            .await
            .with_context(|| format!("bind {}:{}", config.bind_addr, config.port))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        let host_ip = if local.ip().is_unspecified() {
            "127.0.0.1".to_owned()
        } else {
            local.ip().to_string()
        };
        tracing::info!(addr = %local, "listening");

        let core_config = ServerConfig {
            host_ip,
            max_bytes_per_session: self.config.max_bytes_per_session,
            max_nodes_per_session: self.config.max_nodes_per_session,
            privilege_hostmasks: self.config.privilege.clone(),
            ..ServerConfig::default()
        };
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("reflect-loop".into())
            .spawn(move || run_reflect_loop(core_config, cmd_rx))
            .context("spawn reflect loop")?;

        let max_body = self.config.max_message_size;
        loop {
            let (stream, peer) = self.listener.accept().await.context("accept")?;
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer, cmd_tx, max_body).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    cmd_tx: std_mpsc::Sender<LoopCommand>,
    max_body: usize,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(addr = %peer, error = %err, "set TCP_NODELAY failed");
    }
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUT_QUEUE_DEPTH);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let (reply_tx, reply_rx) = oneshot::channel();
    if cmd_tx
        .send(LoopCommand::Attach {
            remote_ip: peer.ip().to_string(),
            out_tx,
            cancel_tx,
            reply: reply_tx,
        })
        .is_err()
    {
        return; // server shutting down
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let session_id = match reply_rx.await {
        Ok(Ok(id)) => id,
        Ok(Err((code, text))) => {
            tracing::info!(addr = %peer, reason = %text, "connection refused");
            let refusal = protocol::error_reply(code, &text, None);
            let _ = gateway::write_message(&mut write_half, &refusal).await;
            return;
        }
        Err(_) => return,
    };

    // Writer: drains the session's outgoing channel onto the socket.  Ends
    // when the reflect loop drops the sender or the session is cancelled.
    let mut writer_cancel = cancel_rx.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = out_rx.recv() => match maybe {
                    Some(msg) => {
                        if let Err(err) = gateway::write_message(&mut write_half, &msg).await {
                            tracing::debug!(session = session_id, error = %err, "write failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.changed() => {
                    if *writer_cancel.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: decodes frames and forwards them to the reflect loop.  Any
    // decode fault disconnects the session.
    let mut scratch = BytesMut::new();
    loop {
        tokio::select! {
            result = gateway::read_message(&mut read_half, &mut scratch, max_body) => {
                match result {
                    Ok(Some(msg)) => {
                        if cmd_tx
                            .send(LoopCommand::Inbound { session_id, msg })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::info!(session = session_id, addr = %peer, error = %err, "gateway fault");
                        break;
                    }
                }
            }
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }
    let _ = cmd_tx.send(LoopCommand::Detach { session_id });
    let _ = writer.await;
}

struct ConnHandle {
    out: mpsc::Sender<Message>,
    cancel: watch::Sender<bool>,
}

// The single-threaded cooperative loop.  All tree and session state lives
// on this thread; the channel recv timeout doubles as the pulse timer.
fn run_reflect_loop(config: ServerConfig, rx: std_mpsc::Receiver<LoopCommand>) {
    let started = Instant::now();
    let mut server = ReflectServer::new(config, 0);
    let mut conns: HashMap<u32, ConnHandle> = HashMap::new();

    loop {
        let now = started.elapsed().as_micros() as u64;
        let wait = server
            .next_pulse_micros()
            .map(|at| Duration::from_micros(at.saturating_sub(now)))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);
        match rx.recv_timeout(wait) {
            Ok(cmd) => {
                let now = started.elapsed().as_micros() as u64;
                dispatch_command(&mut server, &mut conns, cmd, now);
                // Drain whatever queued up while we were busy.
                while let Ok(cmd) = rx.try_recv() {
                    dispatch_command(&mut server, &mut conns, cmd, now);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                tracing::info!("command queue closed, reflect loop exiting");
                break;
            }
        }

        let now = started.elapsed().as_micros() as u64;
        server.pulse(now);
        deliver_outbound(&mut server, &conns);
        // Sessions that overflowed are detached here, on the loop thread.
        for session_id in server.marked_sessions() {
            if let Some(conn) = conns.remove(&session_id) {
                let _ = conn.cancel.send(true);
            }
            server.detach_session(session_id, now);
        }
        deliver_outbound(&mut server, &conns);
    }
}

fn dispatch_command(
    server: &mut ReflectServer,
    conns: &mut HashMap<u32, ConnHandle>,
    cmd: LoopCommand,
    now: u64,
) {
    match cmd {
        LoopCommand::Attach {
            remote_ip,
            out_tx,
            cancel_tx,
            reply,
        } => match server.attach_session(&remote_ip, now) {
            Ok(id) => {
                conns.insert(
                    id,
                    ConnHandle {
                        out: out_tx,
                        cancel: cancel_tx,
                    },
                );
                let _ = reply.send(Ok(id));
            }
            Err(err) => {
                let _ = reply.send(Err((err.code(), err.to_string())));
            }
        },
        LoopCommand::Inbound { session_id, msg } => {
            server.handle_message(session_id, &msg, now);
        }
        LoopCommand::Detach { session_id } => {
            if let Some(conn) = conns.remove(&session_id) {
                let _ = conn.cancel.send(true);
            }
            server.detach_session(session_id, now);
        }
    }
}

fn deliver_outbound(server: &mut ReflectServer, conns: &HashMap<u32, ConnHandle>) {
    for outbound in server.drain_outbound() {
        let Some(conn) = conns.get(&outbound.session_id) else {
            continue;
        };
        if conn.out.try_send(outbound.msg).is_err() {
            // The socket is not keeping up even with the buffered channel.
            server.note_send_overflow(outbound.session_id);
        }
    }
}
