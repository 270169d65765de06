// The reflection server state machine: the global tree, the session table,
// request dispatch, subscription fanout, and the pulse schedule.
//
// This type performs no I/O and reads no clocks.  The event-loop driver
// feeds it decoded messages and the current time in microseconds, then
// drains `(session, message)` pairs and disconnect decisions.
use std::collections::HashMap;
use std::rc::Rc;

use muscle_pool::ObjectPool;
use muscle_wire::protocol::{self, field_names};
use muscle_wire::{Field, Message};

use crate::error::{ReflectError, Result};
use crate::matcher::{has_wildcards, PathMatcher, SegmentMatcher};
use crate::node::{
    self, find_first_matching_node, new_node, node_path, put_child, remove_child, visit_matching,
    ChangeSink, IndexOp, NodePool, NodeRef,
};
use crate::session::{session_id_string, PendingItem, SessionParams, SessionState, Subscription};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Textual host IP used as the first path segment of every session root.
    pub host_ip: String,
    /// Byte budget for each session's pending-update buffer.
    pub max_bytes_per_session: usize,
    /// Cap on tree nodes a single session may create.
    pub max_nodes_per_session: u32,
    /// Update flush cadence.
    pub flush_interval_micros: u64,
    /// When non-empty, only clients whose address matches one of these
    /// wildcard hostmasks may attach.
    pub privilege_hostmasks: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_owned(),
            max_bytes_per_session: 4 * 1024 * 1024,
            max_nodes_per_session: 100_000,
            flush_interval_micros: 20_000,
            privilege_hostmasks: Vec::new(),
        }
    }
}

/// A message ready to leave for one session's socket.
#[derive(Debug)]
pub struct Outbound {
    pub session_id: u32,
    pub msg: Message,
}

pub struct ReflectServer {
    config: ServerConfig,
    hostmasks: Vec<SegmentMatcher>,
    pool: NodePool,
    root: NodeRef,
    sessions: HashMap<u32, SessionState>,
    sessions_by_name: HashMap<String, u32>,
    next_session_id: u32,
    // Shared scratch parameters visible to every session.
    central_state: Message,
    start_micros: u64,
    outbound: Vec<Outbound>,
}

// Delivers tree-change notifications into session pending buffers the
// moment a mutation happens, which keeps update order causal.
struct FanoutSink<'a> {
    sessions: &'a mut HashMap<u32, SessionState>,
    now_micros: u64,
    flush_interval: u64,
}

impl ChangeSink for FanoutSink<'_> {
    fn node_created(&mut self, node_ref: &NodeRef, path: &str) {
        let depth = node_ref.borrow().depth() as usize;
        for session in self.sessions.values_mut() {
            let mut hits = 0u32;
            for sub in &mut session.subscriptions {
                if sub.matcher.segment_count() == depth && sub.matcher.matches_path(path) {
                    sub.match_count += 1;
                    hits += 1;
                }
            }
            if hits > 0 {
                {
                    let mut inner = node_ref.borrow_mut();
                    for _ in 0..hits {
                        inner.increment_subscriber(session.id);
                    }
                }
                let payload = node_ref.borrow().payload().cloned();
                session.enqueue(
                    PendingItem::NodeUpdated {
                        path: path.to_owned(),
                        payload,
                        old: None,
                    },
                    self.now_micros,
                    self.flush_interval,
                );
            }
        }
    }

    fn node_changed(
        &mut self,
        node_ref: &NodeRef,
        path: &str,
        old: Option<Rc<Message>>,
        removed: bool,
    ) {
        for session_id in node_ref.borrow().subscriber_sessions() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            if removed {
                session.enqueue(
                    PendingItem::NodeRemoved {
                        path: path.to_owned(),
                    },
                    self.now_micros,
                    self.flush_interval,
                );
                for sub in &mut session.subscriptions {
                    if sub.matcher.matches_path(path) {
                        sub.match_count = sub.match_count.saturating_sub(1);
                    }
                }
            } else {
                let payload = node_ref.borrow().payload().cloned();
                let old = session
                    .params
                    .include_old_payload
                    .then(|| old.clone())
                    .flatten();
                session.enqueue(
                    PendingItem::NodeUpdated {
                        path: path.to_owned(),
                        payload,
                        old,
                    },
                    self.now_micros,
                    self.flush_interval,
                );
            }
        }
    }

    fn index_changed(&mut self, node_ref: &NodeRef, path: &str, op: IndexOp) {
        let (inserted, pos, name) = match op {
            IndexOp::Inserted { pos, name } => (true, pos, name),
            IndexOp::Removed { pos, name } => (false, pos, name),
        };
        for session_id in node_ref.borrow().subscriber_sessions() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            session.enqueue(
                PendingItem::IndexOp {
                    path: path.to_owned(),
                    inserted,
                    pos,
                    name: name.clone(),
                },
                self.now_micros,
                self.flush_interval,
            );
        }
    }
}

impl ReflectServer {
    pub fn new(config: ServerConfig, start_micros: u64) -> Self {
        let hostmasks = config
            .privilege_hostmasks
            .iter()
            .filter_map(|mask| match SegmentMatcher::parse(mask) {
                Ok(matcher) => Some(matcher),
                Err(err) => {
                    tracing::warn!(mask, error = %err, "ignoring unparsable hostmask");
                    None
                }
            })
            .collect();
        let pool: NodePool = ObjectPool::new();
        let root = new_node(&pool, "", None);
        let mut central_state = Message::new(0);
        central_state.set_field(
            field_names::HOST,
            Field::String(vec![config.host_ip.clone()]),
        );
        central_state.set_field("start", Field::Int64(vec![start_micros as i64]));
        Self {
            config,
            hostmasks,
            pool,
            root,
            sessions: HashMap::new(),
            sessions_by_name: HashMap::new(),
            next_session_id: 1,
            central_state,
            start_micros,
            outbound: Vec::new(),
        }
    }

    pub fn host_ip(&self) -> &str {
        &self.config.host_ip
    }

    /// Monotonic microsecond timestamp the server was constructed at.
    pub fn start_micros(&self) -> u64 {
        self.start_micros
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_id_by_name(&self, name: &str) -> Option<u32> {
        self.sessions_by_name.get(name).copied()
    }

    pub fn central_state(&self) -> &Message {
        &self.central_state
    }

    pub fn central_state_mut(&mut self) -> &mut Message {
        &mut self.central_state
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Creates a session and its subtree at `/<host>/<paddedId>`, and queues
    /// the hello greeting.  Fails with `AccessDenied` when a privilege list
    /// is configured and the address matches no mask.
    pub fn attach_session(&mut self, remote_ip: &str, now_micros: u64) -> Result<u32> {
        if !self.hostmasks.is_empty() && !self.hostmasks.iter().any(|m| m.matches(remote_ip)) {
            return Err(ReflectError::AccessDenied(format!(
                "address {remote_ip} matches no privilege hostmask"
            )));
        }
        let id = self.next_session_id;
        self.next_session_id += 1;
        let id_string = session_id_string(id);

        let mut sink = FanoutSink {
            sessions: &mut self.sessions,
            now_micros,
            flush_interval: self.config.flush_interval_micros,
        };
        let existing_host = self.root.borrow().child(&self.config.host_ip);
        let host = match existing_host {
            Some(host) => host,
            None => {
                let host = new_node(&self.pool, &self.config.host_ip, None);
                put_child(&self.root, host.clone(), &mut sink, false)?;
                host
            }
        };
        let session_root = new_node(&self.pool, &id_string, None);
        put_child(&host, session_root.clone(), &mut sink, false)?;

        let params = SessionParams {
            max_pending_bytes: self.config.max_bytes_per_session,
            ..SessionParams::default()
        };
        let session = SessionState::new(id, remote_ip.to_owned(), session_root, params);
        self.sessions_by_name.insert(id_string, id);
        self.sessions.insert(id, session);

        self.outbound.push(Outbound {
            session_id: id,
            msg: protocol::hello(&self.config.host_ip, id),
        });
        metrics::counter!("reflect_sessions_attached_total").increment(1);
        metrics::gauge!("reflect_sessions_active").set(self.sessions.len() as f64);
        tracing::info!(session = id, addr = remote_ip, "session attached");
        Ok(id)
    }

    /// Tears the session down: subscriptions unwound, subtree removed with
    /// notifications to the remaining sessions, outbound queue abandoned.
    pub fn detach_session(&mut self, id: u32, now_micros: u64) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        self.sessions_by_name.remove(&session.id_string);
        for sub in &session.subscriptions {
            visit_matching(&self.root, sub.matcher.segments(), &mut |node| {
                node.borrow_mut().decrement_subscriber(id);
            });
        }

        let mut sink = FanoutSink {
            sessions: &mut self.sessions,
            now_micros,
            flush_interval: self.config.flush_interval_micros,
        };
        let host = self.root.borrow().child(&self.config.host_ip);
        if let Some(host) = host {
            let mut removed = 0;
            if let Err(err) = remove_child(&host, &session.id_string, &mut sink, true, &mut removed)
            {
                tracing::warn!(session = id, error = %err, "session subtree already gone");
            }
            if host.borrow().child_count() == 0 {
                let host_name = host.borrow().name().to_owned();
                let _ = remove_child(&self.root, &host_name, &mut sink, false, &mut removed);
            }
        }
        metrics::gauge!("reflect_sessions_active").set(self.sessions.len() as f64);
        tracing::info!(session = id, "session detached");
    }

    /// Dispatches one decoded client message.  Recoverable errors become
    /// error replies; the session stays attached.
    pub fn handle_message(&mut self, id: u32, msg: &Message, now_micros: u64) {
        if !self.sessions.contains_key(&id) {
            return;
        }
        metrics::counter!("reflect_messages_handled_total").increment(1);
        let tag = msg.first_i32(field_names::TAG).ok();
        if let Err(err) = self.dispatch(id, msg, tag, now_micros) {
            tracing::debug!(session = id, what = format_args!("{:#010x}", msg.what), error = %err, "request failed");
            self.outbound.push(Outbound {
                session_id: id,
                msg: protocol::error_reply(err.code(), &err.to_string(), tag),
            });
        }
    }

    fn dispatch(&mut self, id: u32, msg: &Message, tag: Option<i32>, now: u64) -> Result<()> {
        match msg.what {
            protocol::CMD_PING => {
                self.outbound.push(Outbound {
                    session_id: id,
                    msg: protocol::pong(msg),
                });
                Ok(())
            }
            protocol::CMD_SET_DATA => self.handle_set_data(id, msg, now),
            protocol::CMD_GET_DATA => self.handle_get_data(id, msg, tag),
            protocol::CMD_REMOVE_DATA => self.handle_remove_data(id, msg, now),
            protocol::CMD_SUBSCRIBE => self.handle_subscribe(id, msg, now),
            protocol::CMD_UNSUBSCRIBE => self.handle_unsubscribe(id, msg),
            protocol::CMD_INSERT_ORDERED => self.handle_insert_ordered(id, msg, now),
            protocol::CMD_REORDER_INDEX => self.handle_reorder(id, msg, now),
            _ => {
                self.reflect_unknown(id, msg);
                Ok(())
            }
        }
    }

    fn handle_set_data(&mut self, id: u32, msg: &Message, now: u64) -> Result<()> {
        let entries: Vec<(String, Message)> = msg
            .fields()
            .filter_map(|(name, field)| match field {
                Field::Message(values) => Some((
                    name.to_owned(),
                    values.first().cloned().unwrap_or_default(),
                )),
                _ => None,
            })
            .collect();
        if entries.is_empty() {
            return Err(ReflectError::BadArgument(
                "set-data carries no node entries".into(),
            ));
        }
        for (path, payload) in entries {
            self.set_data_at_path(id, &path, payload, now)?;
        }
        Ok(())
    }

    fn set_data_at_path(&mut self, id: u32, path: &str, payload: Message, now: u64) -> Result<()> {
        if path.starts_with('/') {
            return Err(ReflectError::AccessDenied(
                "writes are restricted to the session subtree".into(),
            ));
        }
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty() || has_wildcards(s)) {
            return Err(ReflectError::BadArgument(format!(
                "set-data path must be literal: {path}"
            )));
        }
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
        let mut cursor = session.root.clone();
        let budget = self.config.max_nodes_per_session;
        let payload = Rc::new(payload);

        let mut sink = FanoutSink {
            sessions: &mut self.sessions,
            now_micros: now,
            flush_interval: self.config.flush_interval_micros,
        };
        let mut created = 0u32;
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let existing = cursor.borrow().child(segment);
            match existing {
                Some(child) => {
                    if i == last {
                        node::set_data(&child, Some(payload.clone()), &mut sink, false);
                    }
                    cursor = child;
                }
                None => {
                    let fresh_payload = (i == last).then(|| payload.clone());
                    let fresh = new_node(&self.pool, segment, fresh_payload);
                    put_child(&cursor, fresh.clone(), &mut sink, false)?;
                    created += 1;
                    cursor = fresh;
                }
            }
        }
        let session = self.sessions.get_mut(&id).expect("session checked above");
        session.node_count += created;
        if session.node_count > budget {
            // The nodes exist; refuse further growth rather than unwinding.
            return Err(ReflectError::OutOfMemory("session node budget exhausted"));
        }
        Ok(())
    }

    fn handle_get_data(&mut self, id: u32, msg: &Message, tag: Option<i32>) -> Result<()> {
        let patterns = msg.strings(field_names::PATHS)?.to_vec();
        let mut reply = Message::new(protocol::RES_DATA_ITEMS);
        if let Some(tag) = tag {
            reply.set_field(field_names::TAG, Field::Int32(vec![tag]));
        }
        for pattern in &patterns {
            let matcher = self.compile_pattern(id, pattern)?;
            visit_matching(&self.root, matcher.segments(), &mut |found| {
                let payload = found
                    .borrow()
                    .payload()
                    .map_or_else(Message::default, |m| (**m).clone());
                reply.set_field(node_path(found), Field::Message(vec![payload]));
            });
        }
        self.outbound.push(Outbound {
            session_id: id,
            msg: reply,
        });
        Ok(())
    }

    fn handle_remove_data(&mut self, id: u32, msg: &Message, now: u64) -> Result<()> {
        let patterns = msg.strings(field_names::PATHS)?.to_vec();
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
        let session_root = session.root.clone();

        let mut total_removed = 0u32;
        for pattern in &patterns {
            if pattern.starts_with('/') {
                return Err(ReflectError::AccessDenied(
                    "removals are restricted to the session subtree".into(),
                ));
            }
            let segments = compile_segments(pattern)?;
            let mut matches = Vec::new();
            visit_matching(&session_root, &segments, &mut |found| {
                matches.push(found.clone());
            });
            let mut sink = FanoutSink {
                sessions: &mut self.sessions,
                now_micros: now,
                flush_interval: self.config.flush_interval_micros,
            };
            for found in matches {
                let (parent, name) = {
                    let inner = found.borrow();
                    (inner.parent(), inner.name().to_owned())
                };
                // Already gone if an earlier pattern removed an ancestor.
                let Some(parent) = parent else { continue };
                remove_child(&parent, &name, &mut sink, true, &mut total_removed)?;
            }
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.node_count = session.node_count.saturating_sub(total_removed);
        }
        Ok(())
    }

    fn handle_subscribe(&mut self, id: u32, msg: &Message, now: u64) -> Result<()> {
        let patterns = msg.strings(field_names::PATHS)?.to_vec();
        let quiet = msg.first_bool(field_names::QUIET).unwrap_or(false);
        {
            let session = self
                .sessions
                .get_mut(&id)
                .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
            if let Ok(include_old) = msg.first_bool(field_names::OLD) {
                session.params.include_old_payload = include_old;
            }
            if let Ok(coalesce) = msg.first_bool(field_names::COALESCE) {
                session.params.coalesce_on_overflow = coalesce;
            }
            if let Ok(rate) = msg.first_i32(field_names::RATE) {
                session.params.max_update_items_per_second = rate.max(0) as u32;
            }
        }

        for pattern in &patterns {
            let matcher = self.compile_pattern(id, pattern)?;
            let normalized = self.normalize_pattern(id, pattern)?;

            let mut matched = Vec::new();
            visit_matching(&self.root, matcher.segments(), &mut |found| {
                found.borrow_mut().increment_subscriber(id);
                matched.push(found.clone());
            });

            let flush_interval = self.config.flush_interval_micros;
            let session = self.sessions.get_mut(&id).expect("session checked above");
            session.subscriptions.push(Subscription {
                pattern: normalized,
                matcher,
                match_count: matched.len() as u64,
            });
            if !quiet {
                // Initial bulk snapshot of everything currently matching.
                for found in &matched {
                    let (path, payload) = {
                        let inner = found.borrow();
                        (node_path(found), inner.payload().cloned())
                    };
                    session.enqueue(
                        PendingItem::NodeUpdated {
                            path,
                            payload,
                            old: None,
                        },
                        now,
                        flush_interval,
                    );
                }
            }
            metrics::counter!("reflect_subscriptions_total").increment(1);
        }
        Ok(())
    }

    fn handle_unsubscribe(&mut self, id: u32, msg: &Message) -> Result<()> {
        let patterns = msg.strings(field_names::PATHS)?.to_vec();
        for pattern in &patterns {
            let normalized = self.normalize_pattern(id, pattern)?;
            let session = self
                .sessions
                .get_mut(&id)
                .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
            let before = session.subscriptions.len();
            let mut dropped = Vec::new();
            session.subscriptions.retain(|sub| {
                if sub.pattern == normalized {
                    dropped.push(sub.matcher.clone());
                    false
                } else {
                    true
                }
            });
            if session.subscriptions.len() == before {
                return Err(ReflectError::DataNotFound(format!(
                    "no subscription {pattern}"
                )));
            }
            for matcher in dropped {
                visit_matching(&self.root, matcher.segments(), &mut |found| {
                    found.borrow_mut().decrement_subscriber(id);
                });
            }
        }
        Ok(())
    }

    fn handle_insert_ordered(&mut self, id: u32, msg: &Message, now: u64) -> Result<()> {
        let path = msg.first_string(field_names::PATH)?.to_owned();
        if path.starts_with('/') {
            return Err(ReflectError::AccessDenied(
                "writes are restricted to the session subtree".into(),
            ));
        }
        let payloads = msg.messages(field_names::PAYLOAD)?.to_vec();
        let before = msg.first_string(field_names::BEFORE).ok().map(str::to_owned);
        let name = msg.first_string(field_names::NAME).ok().map(str::to_owned);

        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
        if session.node_count + payloads.len() as u32 > self.config.max_nodes_per_session {
            return Err(ReflectError::OutOfMemory("session node budget exhausted"));
        }
        let parent = find_first_matching_node(&session.root, &path, u32::MAX)
            .ok_or_else(|| ReflectError::DataNotFound(path.clone()))?;

        let mut sink = FanoutSink {
            sessions: &mut self.sessions,
            now_micros: now,
            flush_interval: self.config.flush_interval_micros,
        };
        let explicit_name = (payloads.len() == 1).then_some(name).flatten();
        let mut created = 0u32;
        for payload in payloads {
            node::insert_ordered_child(
                &parent,
                &self.pool,
                Some(Rc::new(payload)),
                before.as_deref(),
                explicit_name.as_deref(),
                &mut sink,
            )?;
            created += 1;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            session.node_count += created;
        }
        Ok(())
    }

    fn handle_reorder(&mut self, id: u32, msg: &Message, now: u64) -> Result<()> {
        let path = msg.first_string(field_names::PATH)?.to_owned();
        if path.starts_with('/') {
            return Err(ReflectError::AccessDenied(
                "writes are restricted to the session subtree".into(),
            ));
        }
        let before = msg.first_string(field_names::BEFORE).ok().map(str::to_owned);
        let (parent_path, child_name) = match path.rsplit_once('/') {
            Some((parent, child)) => (parent.to_owned(), child.to_owned()),
            None => (String::new(), path),
        };
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
        let parent = find_first_matching_node(&session.root, &parent_path, u32::MAX)
            .ok_or_else(|| ReflectError::DataNotFound(parent_path.clone()))?;
        let mut sink = FanoutSink {
            sessions: &mut self.sessions,
            now_micros: now,
            flush_interval: self.config.flush_interval_micros,
        };
        node::reorder_child(&parent, &child_name, before.as_deref(), &mut sink)
    }

    // Unknown what-codes are reflected to sessions watching the sender's
    // subtree, or dropped.
    fn reflect_unknown(&mut self, id: u32, msg: &Message) {
        let Some(sender) = self.sessions.get(&id) else {
            return;
        };
        let sender_root = node_path(&sender.root);
        let mut forwarded = msg.clone();
        forwarded.set_field(field_names::FROM, Field::Int32(vec![id as i32]));
        let targets: Vec<u32> = self
            .sessions
            .values()
            .filter(|other| {
                other.id != id
                    && other
                        .subscriptions
                        .iter()
                        .any(|sub| sub.matcher.matches_prefix(&sender_root))
            })
            .map(|other| other.id)
            .collect();
        if targets.is_empty() {
            metrics::counter!("reflect_unknown_dropped_total").increment(1);
            return;
        }
        for target in targets {
            self.outbound.push(Outbound {
                session_id: target,
                msg: forwarded.clone(),
            });
        }
    }

    // Absolute patterns pass through; relative ones are rooted at the
    // session's own subtree.
    fn normalize_pattern(&self, id: u32, pattern: &str) -> Result<String> {
        if pattern.starts_with('/') {
            return Ok(pattern.to_owned());
        }
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReflectError::BadObject("session is gone"))?;
        Ok(format!(
            "/{}/{}/{}",
            self.config.host_ip, session.id_string, pattern
        ))
    }

    fn compile_pattern(&self, id: u32, pattern: &str) -> Result<PathMatcher> {
        PathMatcher::parse(&self.normalize_pattern(id, pattern)?)
    }

    /// Earliest absolute time any session wants a pulse, or `None` for
    /// "never".
    pub fn next_pulse_micros(&self) -> Option<u64> {
        self.sessions
            .values()
            .filter_map(SessionState::next_flush_micros)
            .min()
    }

    /// Flushes every session whose deadline has arrived.
    pub fn pulse(&mut self, now_micros: u64) {
        let mut due: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| s.next_flush_micros().is_some_and(|t| t <= now_micros))
            .map(|s| s.id)
            .collect();
        due.sort_unstable();
        for id in due {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let msgs = session.flush(now_micros, self.config.flush_interval_micros);
            for msg in msgs {
                metrics::counter!("reflect_updates_flushed_total").increment(1);
                self.outbound.push(Outbound {
                    session_id: id,
                    msg,
                });
            }
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Sessions whose pending buffers overflowed without coalescing, or
    /// whose wire queue jammed.  The driver should detach them.
    pub fn marked_sessions(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| s.marked_for_disconnect)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Wire-level backpressure report from the driver.
    pub fn note_send_overflow(&mut self, id: u32) {
        if let Some(session) = self.sessions.get_mut(&id) {
            tracing::warn!(session = id, "outgoing channel jammed, disconnecting");
            session.marked_for_disconnect = true;
        }
    }
}

fn compile_segments(pattern: &str) -> Result<Vec<SegmentMatcher>> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(SegmentMatcher::parse)
        .collect()
}
