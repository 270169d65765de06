// Per-session state: compiled subscriptions, the pending-update buffer, and
// the flush machinery that turns buffered changes into wire messages.
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use muscle_wire::protocol::{self, field_names};
use muscle_wire::{Field, Message};

use crate::matcher::PathMatcher;
use crate::node::NodeRef;

/// One installed subscription: the raw pattern, its compiled matcher, and a
/// count of nodes currently matched.
#[derive(Debug)]
pub struct Subscription {
    pub pattern: String,
    pub matcher: PathMatcher,
    pub match_count: u64,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Include the previous payload alongside changed data.
    pub include_old_payload: bool,
    /// On pending-buffer overflow, drop oldest updates instead of
    /// disconnecting.
    pub coalesce_on_overflow: bool,
    /// Cap on update items released per second; 0 means unlimited.
    pub max_update_items_per_second: u32,
    /// Byte budget for the pending-update buffer.
    pub max_pending_bytes: usize,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            include_old_payload: false,
            coalesce_on_overflow: true,
            max_update_items_per_second: 0,
            max_pending_bytes: 4 * 1024 * 1024,
        }
    }
}

/// One buffered change, in causal order.
#[derive(Debug, Clone)]
pub enum PendingItem {
    NodeUpdated {
        path: String,
        payload: Option<Rc<Message>>,
        old: Option<Rc<Message>>,
    },
    NodeRemoved {
        path: String,
    },
    IndexOp {
        path: String,
        inserted: bool,
        pos: u32,
        name: String,
    },
}

impl PendingItem {
    fn byte_cost(&self) -> usize {
        match self {
            PendingItem::NodeUpdated { path, payload, old } => {
                path.len()
                    + payload.as_ref().map_or(0, |m| m.flattened_size())
                    + old.as_ref().map_or(0, |m| m.flattened_size())
            }
            PendingItem::NodeRemoved { path } => path.len(),
            PendingItem::IndexOp { path, name, .. } => path.len() + name.len() + 8,
        }
    }
}

#[derive(Debug)]
pub struct SessionState {
    pub id: u32,
    pub id_string: String,
    pub remote_ip: String,
    /// This session's own subtree root under `/<host>/<id>`.
    pub root: NodeRef,
    pub subscriptions: Vec<Subscription>,
    pub params: SessionParams,
    /// Nodes created on behalf of this session, against the server budget.
    pub node_count: u32,
    pub marked_for_disconnect: bool,
    pending: VecDeque<PendingItem>,
    pending_bytes: usize,
    next_flush_micros: Option<u64>,
}

impl SessionState {
    pub fn new(id: u32, remote_ip: String, root: NodeRef, params: SessionParams) -> Self {
        Self {
            id,
            id_string: session_id_string(id),
            remote_ip,
            root,
            subscriptions: Vec::new(),
            params,
            node_count: 0,
            marked_for_disconnect: false,
            pending: VecDeque::new(),
            pending_bytes: 0,
            next_flush_micros: None,
        }
    }

    pub fn next_flush_micros(&self) -> Option<u64> {
        self.next_flush_micros
    }

    /// Buffers a change and schedules the next flush.  Overruns of the byte
    /// budget drop the oldest updates when coalescing is allowed, otherwise
    /// the session is marked for disconnect.
    pub fn enqueue(&mut self, item: PendingItem, now_micros: u64, flush_interval_micros: u64) {
        self.pending_bytes += item.byte_cost();
        self.pending.push_back(item);
        while self.pending_bytes > self.params.max_pending_bytes {
            if !self.params.coalesce_on_overflow {
                tracing::warn!(session = self.id, "update buffer overflow, disconnecting");
                metrics::counter!("reflect_session_overflow_disconnects_total").increment(1);
                self.marked_for_disconnect = true;
                return;
            }
            match self.pending.pop_front() {
                Some(dropped) => {
                    self.pending_bytes -= dropped.byte_cost();
                    metrics::counter!("reflect_updates_dropped_total").increment(1);
                }
                None => break,
            }
        }
        if self.next_flush_micros.is_none() {
            self.next_flush_micros = Some(now_micros + flush_interval_micros);
        }
    }

    /// Releases buffered items as aggregated update messages, honoring the
    /// per-second item cap; overflow items carry into the next pulse.
    pub fn flush(&mut self, now_micros: u64, flush_interval_micros: u64) -> Vec<Message> {
        let budget = match self.params.max_update_items_per_second {
            0 => usize::MAX,
            rate => {
                let per_flush =
                    (u64::from(rate) * flush_interval_micros / 1_000_000).max(1) as usize;
                per_flush
            }
        };

        let mut out = Vec::new();
        let mut builder = UpdateBuilder::new();
        let mut released = 0usize;
        while released < budget {
            let Some(item) = self.pending.pop_front() else {
                break;
            };
            self.pending_bytes -= item.byte_cost();
            released += 1;
            if builder.conflicts_with(&item) {
                // The same path appears on both sides of an add/remove; cut
                // the message here so the peer applies them in order.
                out.extend(builder.finish());
                builder = UpdateBuilder::new();
            }
            builder.push(item, self.params.include_old_payload);
        }
        out.extend(builder.finish());

        self.next_flush_micros = if self.pending.is_empty() {
            None
        } else {
            Some(now_micros + flush_interval_micros)
        };
        out
    }
}

/// Renders a session id as the zero-padded string used for its subtree name.
pub fn session_id_string(id: u32) -> String {
    format!("{id:010}")
}

// Accumulates pending items into one RES_DATA_ITEMS message, keyed by path.
struct UpdateBuilder {
    msg: Message,
    updated: HashSet<String>,
    removed: HashSet<String>,
}

impl UpdateBuilder {
    fn new() -> Self {
        Self {
            msg: Message::new(protocol::RES_DATA_ITEMS),
            updated: HashSet::new(),
            removed: HashSet::new(),
        }
    }

    fn conflicts_with(&self, item: &PendingItem) -> bool {
        match item {
            PendingItem::NodeUpdated { path, .. } => self.removed.contains(path),
            PendingItem::NodeRemoved { path } => self.updated.contains(path),
            PendingItem::IndexOp { .. } => false,
        }
    }

    fn push(&mut self, item: PendingItem, include_old: bool) {
        match item {
            PendingItem::NodeUpdated { path, payload, old } => {
                // Later updates to the same path supersede earlier ones.
                let mut values = vec![payload.map_or_else(Message::default, |m| (*m).clone())];
                if include_old {
                    if let Some(old) = old {
                        values.push((*old).clone());
                    }
                }
                self.msg.set_field(path.clone(), Field::Message(values));
                self.updated.insert(path);
            }
            PendingItem::NodeRemoved { path } => {
                if self.removed.insert(path.clone()) {
                    let _ = self
                        .msg
                        .add_field(field_names::REMOVED, Field::String(vec![path]));
                }
            }
            PendingItem::IndexOp {
                path,
                inserted,
                pos,
                name,
            } => {
                let op = if inserted {
                    protocol::INDEX_OP_INSERTED
                } else {
                    protocol::INDEX_OP_REMOVED
                };
                let _ = self.msg.add_field(
                    field_names::INDEX,
                    Field::Message(vec![protocol::index_op(&path, op, pos, &name)]),
                );
            }
        }
    }

    fn finish(self) -> Option<Message> {
        (!self.msg.is_empty()).then_some(self.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{new_node, NodePool};
    use muscle_pool::ObjectPool;
    use muscle_wire::protocol::parse_update;

    const INTERVAL: u64 = 20_000;

    fn session(params: SessionParams) -> SessionState {
        let pool: NodePool = ObjectPool::new();
        let root = new_node(&pool, session_id_string(9).as_str(), None);
        SessionState::new(9, "127.0.0.1".into(), root, params)
    }

    fn payload(n: i32) -> Rc<Message> {
        let mut msg = Message::new(1);
        msg.set_field("n", Field::Int32(vec![n]));
        Rc::new(msg)
    }

    fn updated(path: &str, n: i32) -> PendingItem {
        PendingItem::NodeUpdated {
            path: path.into(),
            payload: Some(payload(n)),
            old: None,
        }
    }

    #[test]
    fn same_path_updates_coalesce_within_one_flush() {
        let mut s = session(SessionParams::default());
        s.enqueue(updated("/h/1/x", 1), 0, INTERVAL);
        s.enqueue(updated("/h/1/x", 2), 0, INTERVAL);
        let msgs = s.flush(INTERVAL, INTERVAL);
        assert_eq!(msgs.len(), 1);
        let update = parse_update(&msgs[0]).expect("parse");
        assert_eq!(update.nodes.len(), 1);
        let node = &update.nodes[0];
        assert_eq!(node.path, "/h/1/x");
        assert_eq!(
            node.payload.as_ref().expect("payload").first_i32("n").expect("n"),
            2
        );
    }

    #[test]
    fn remove_after_update_splits_the_message() {
        let mut s = session(SessionParams::default());
        s.enqueue(updated("/h/1/x", 1), 0, INTERVAL);
        s.enqueue(PendingItem::NodeRemoved { path: "/h/1/x".into() }, 0, INTERVAL);
        s.enqueue(updated("/h/1/x", 3), 0, INTERVAL);
        let msgs = s.flush(INTERVAL, INTERVAL);
        // update | remove | update again, each cut at the conflict.
        assert_eq!(msgs.len(), 3);
        assert!(parse_update(&msgs[1]).expect("parse").nodes[0].payload.is_none());
    }

    #[test]
    fn old_payload_rides_along_when_enabled() {
        let mut s = session(SessionParams {
            include_old_payload: true,
            ..SessionParams::default()
        });
        s.enqueue(
            PendingItem::NodeUpdated {
                path: "/h/1/x".into(),
                payload: Some(payload(2)),
                old: Some(payload(1)),
            },
            0,
            INTERVAL,
        );
        let msgs = s.flush(INTERVAL, INTERVAL);
        let update = parse_update(&msgs[0]).expect("parse");
        let node = &update.nodes[0];
        assert_eq!(
            node.old_payload.as_ref().expect("old").first_i32("n").expect("n"),
            1
        );
    }

    #[test]
    fn rate_limit_carries_overflow_into_next_pulse() {
        let mut s = session(SessionParams {
            // 100 items/second at a 20ms flush interval = 2 per flush.
            max_update_items_per_second: 100,
            ..SessionParams::default()
        });
        for i in 0..5 {
            s.enqueue(updated(&format!("/h/1/n{i}"), i), 0, INTERVAL);
        }
        let first = s.flush(INTERVAL, INTERVAL);
        assert_eq!(parse_update(&first[0]).expect("parse").nodes.len(), 2);
        assert!(s.next_flush_micros().is_some());
        let second = s.flush(2 * INTERVAL, INTERVAL);
        assert_eq!(parse_update(&second[0]).expect("parse").nodes.len(), 2);
        let third = s.flush(3 * INTERVAL, INTERVAL);
        assert_eq!(parse_update(&third[0]).expect("parse").nodes.len(), 1);
        assert!(s.next_flush_micros().is_none());
    }

    #[test]
    fn overflow_drops_oldest_when_coalescing() {
        let mut s = session(SessionParams {
            max_pending_bytes: 1024,
            coalesce_on_overflow: true,
            ..SessionParams::default()
        });
        for i in 0..10 {
            let mut big = Message::new(1);
            big.set_field("fill", Field::UInt8(vec![0u8; 300]));
            s.enqueue(
                PendingItem::NodeUpdated {
                    path: format!("/h/1/big{i}"),
                    payload: Some(Rc::new(big)),
                    old: None,
                },
                0,
                INTERVAL,
            );
        }
        assert!(!s.marked_for_disconnect);
        let msgs = s.flush(INTERVAL, INTERVAL);
        assert_eq!(msgs.len(), 1);
        let update = parse_update(&msgs[0]).expect("parse");
        // Only the newest updates survived the byte cap.
        assert!(update.nodes.len() < 10);
        assert!(update.nodes.iter().any(|n| n.path == "/h/1/big9"));
    }

    #[test]
    fn overflow_disconnects_when_coalescing_is_off() {
        let mut s = session(SessionParams {
            max_pending_bytes: 1024,
            coalesce_on_overflow: false,
            ..SessionParams::default()
        });
        for i in 0..10 {
            let mut big = Message::new(1);
            big.set_field("fill", Field::UInt8(vec![0u8; 300]));
            s.enqueue(
                PendingItem::NodeUpdated {
                    path: format!("/h/1/big{i}"),
                    payload: Some(Rc::new(big)),
                    old: None,
                },
                0,
                INTERVAL,
            );
        }
        assert!(s.marked_for_disconnect);
    }

    #[test]
    fn index_ops_preserve_order() {
        let mut s = session(SessionParams::default());
        s.enqueue(
            PendingItem::IndexOp {
                path: "/h/1/p".into(),
                inserted: false,
                pos: 2,
                name: "c".into(),
            },
            0,
            INTERVAL,
        );
        s.enqueue(
            PendingItem::IndexOp {
                path: "/h/1/p".into(),
                inserted: true,
                pos: 0,
                name: "c".into(),
            },
            0,
            INTERVAL,
        );
        let msgs = s.flush(INTERVAL, INTERVAL);
        let update = parse_update(&msgs[0]).expect("parse");
        assert_eq!(update.index_ops.len(), 2);
        assert_eq!(update.index_ops[0].op, muscle_wire::protocol::IndexOpKind::Removed);
        assert_eq!(update.index_ops[1].op, muscle_wire::protocol::IndexOpKind::Inserted);
    }

    #[test]
    fn id_strings_are_zero_padded() {
        assert_eq!(session_id_string(7), "0000000007");
        assert_eq!(session_id_string(4_000_000_000), "4000000000");
    }
}
