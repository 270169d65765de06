// Command and result codes spoken between reflect clients and the server,
// plus the layout of aggregated tree-update messages.
use crate::field::Field;
use crate::message::Message;
use crate::{fourcc, Error, Result};

pub const CMD_SET_DATA: u32 = fourcc(*b"mSET");
pub const CMD_GET_DATA: u32 = fourcc(*b"mGET");
pub const CMD_REMOVE_DATA: u32 = fourcc(*b"mDEL");
pub const CMD_SUBSCRIBE: u32 = fourcc(*b"mSUB");
pub const CMD_UNSUBSCRIBE: u32 = fourcc(*b"mUNS");
pub const CMD_INSERT_ORDERED: u32 = fourcc(*b"mINS");
pub const CMD_REORDER_INDEX: u32 = fourcc(*b"mORD");
pub const CMD_PING: u32 = fourcc(*b"mPNG");

pub const RES_HELLO: u32 = fourcc(*b"mHLO");
pub const RES_DATA_ITEMS: u32 = fourcc(*b"mDAT");
pub const RES_PONG: u32 = fourcc(*b"mPOG");
pub const RES_ERROR: u32 = fourcc(*b"mERR");

/// What-code of the nested messages describing one ordered-index operation.
pub const MSG_INDEX_OP: u32 = fourcc(*b"mIDX");

/// Well-known field names.  Node entries in update messages are named by
/// their absolute path, which always begins with `/`, so none of these can
/// collide with one.
pub mod field_names {
    pub const PATHS: &str = "paths";
    pub const PATH: &str = "path";
    pub const BEFORE: &str = "before";
    pub const NAME: &str = "name";
    pub const PAYLOAD: &str = "payload";
    pub const QUIET: &str = "quiet";
    pub const OLD: &str = "old";
    pub const COALESCE: &str = "coalesce";
    pub const RATE: &str = "rate";
    pub const TAG: &str = "_tag";
    pub const FROM: &str = "_from";
    pub const HOST: &str = "host";
    pub const SESSION: &str = "session";
    pub const REMOVED: &str = "removed";
    pub const INDEX: &str = "index";
    pub const ERROR: &str = "error";
    pub const CODE: &str = "code";
    pub const OP: &str = "op";
    pub const POS: &str = "pos";
}

pub const INDEX_OP_INSERTED: i8 = b'i' as i8;
pub const INDEX_OP_REMOVED: i8 = b'r' as i8;

/// The greeting a server sends as its first message on a fresh connection.
pub fn hello(host: &str, session_id: u32) -> Message {
    let mut msg = Message::new(RES_HELLO);
    msg.set_field(field_names::HOST, Field::String(vec![host.to_owned()]));
    msg.set_field(field_names::SESSION, Field::Int32(vec![session_id as i32]));
    msg
}

/// An error result, echoing the request tag when the request carried one.
pub fn error_reply(code: i32, text: &str, tag: Option<i32>) -> Message {
    let mut msg = Message::new(RES_ERROR);
    msg.set_field(field_names::ERROR, Field::String(vec![text.to_owned()]));
    msg.set_field(field_names::CODE, Field::Int32(vec![code]));
    if let Some(tag) = tag {
        msg.set_field(field_names::TAG, Field::Int32(vec![tag]));
    }
    msg
}

/// Pings echo back with every request field intact.
pub fn pong(ping: &Message) -> Message {
    let mut msg = ping.clone();
    msg.what = RES_PONG;
    msg
}

pub fn index_op(path: &str, op: i8, pos: u32, name: &str) -> Message {
    let mut msg = Message::new(MSG_INDEX_OP);
    msg.set_field(field_names::PATH, Field::String(vec![path.to_owned()]));
    msg.set_field(field_names::OP, Field::Int8(vec![op]));
    msg.set_field(field_names::POS, Field::Int32(vec![pos as i32]));
    msg.set_field(field_names::NAME, Field::String(vec![name.to_owned()]));
    msg
}

/// One node entry decoded from an update message.  A `None` payload means
/// the node was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub path: String,
    pub payload: Option<Message>,
    pub old_payload: Option<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOpKind {
    Inserted,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexUpdate {
    pub path: String,
    pub op: IndexOpKind,
    pub pos: u32,
    pub name: String,
}

/// A decoded `RES_DATA_ITEMS` message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeUpdate {
    pub nodes: Vec<NodeUpdate>,
    pub index_ops: Vec<IndexUpdate>,
    pub tag: Option<i32>,
}

/// Decodes an aggregated update: path-named message fields carry new (and
/// optionally old) payloads, `removed` lists dropped paths, and `index`
/// holds ordered-index operations.
pub fn parse_update(msg: &Message) -> Result<TreeUpdate> {
    if msg.what != RES_DATA_ITEMS {
        return Err(Error::BadData("not a data-items message"));
    }
    let mut update = TreeUpdate {
        tag: msg.first_i32(field_names::TAG).ok(),
        ..TreeUpdate::default()
    };
    for (name, field) in msg.fields() {
        if name.starts_with('/') {
            let items = match field {
                Field::Message(items) => items,
                _ => return Err(Error::BadData("node entry is not a message field")),
            };
            update.nodes.push(NodeUpdate {
                path: name.to_owned(),
                payload: items.first().cloned(),
                old_payload: items.get(1).cloned(),
            });
        }
    }
    if let Ok(removed) = msg.strings(field_names::REMOVED) {
        for path in removed {
            update.nodes.push(NodeUpdate {
                path: path.clone(),
                payload: None,
                old_payload: None,
            });
        }
    }
    if let Ok(ops) = msg.messages(field_names::INDEX) {
        for op in ops {
            let kind = match op.get(field_names::OP, crate::type_code::INT8)? {
                Field::Int8(v) if v.first() == Some(&INDEX_OP_INSERTED) => IndexOpKind::Inserted,
                Field::Int8(v) if v.first() == Some(&INDEX_OP_REMOVED) => IndexOpKind::Removed,
                _ => return Err(Error::BadData("unknown index op")),
            };
            update.index_ops.push(IndexUpdate {
                path: op.first_string(field_names::PATH)?.to_owned(),
                op: kind,
                pos: op.first_i32(field_names::POS)? as u32,
                name: op.first_string(field_names::NAME)?.to_owned(),
            });
        }
    }
    Ok(update)
}
