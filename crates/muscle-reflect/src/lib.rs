// Message-reflection core: the shared data-node tree, wildcard
// subscriptions, per-session update aggregation, and the server state
// machine that binds them.  All types here are synchronous and single
// threaded; the daemon's event loop owns one `ReflectServer` and drives it
// with decoded messages and timestamps.
pub mod error;
pub mod matcher;
pub mod node;
pub mod server;
pub mod session;

pub use error::{ReflectError, Result};
pub use matcher::{PathMatcher, SegmentMatcher};
pub use node::{DataNode, NodePool, NodeRef};
pub use server::{Outbound, ReflectServer, ServerConfig};
pub use session::{SessionParams, SessionState};
