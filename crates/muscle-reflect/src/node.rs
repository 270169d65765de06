// The hierarchical data-node tree.
//
// Nodes are pool-backed and shared through `Rc` handles; parent links are
// weak so ownership flows strictly downward through the child maps.  Tree
// operations report their effects through a `ChangeSink` at the moment they
// happen, which is what keeps notification order causal.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use muscle_pool::{ObjectPool, PoolRef, Pooled, Recycle};
use muscle_wire::{rolling_checksum, Message};

use crate::error::{ReflectError, Result};
use crate::matcher::{has_wildcards, SegmentMatcher};

/// Newtype over `RefCell<DataNode>` so `Recycle` can be implemented for it
/// locally (the orphan rules forbid implementing a foreign trait for a bare
/// foreign `RefCell<_>`).
#[derive(Debug)]
pub struct NodeCell(RefCell<DataNode>);

impl std::ops::Deref for NodeCell {
    type Target = RefCell<DataNode>;

    fn deref(&self) -> &RefCell<DataNode> {
        &self.0
    }
}

impl std::ops::DerefMut for NodeCell {
    fn deref_mut(&mut self) -> &mut RefCell<DataNode> {
        &mut self.0
    }
}

impl Default for NodeCell {
    fn default() -> Self {
        NodeCell(RefCell::new(DataNode::default()))
    }
}

pub type NodeRef = PoolRef<NodeCell>;
pub type NodeWeak = Weak<Pooled<NodeCell>>;
pub type NodePool = std::sync::Arc<ObjectPool<NodeCell>>;

/// Ordered-index change reported to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Inserted { pos: u32, name: String },
    Removed { pos: u32, name: String },
}

/// Receives tree-change notifications as mutations happen.  Implementations
/// must not mutate tree structure from inside a callback.
pub trait ChangeSink {
    fn node_created(&mut self, node: &NodeRef, path: &str);
    fn node_changed(&mut self, node: &NodeRef, path: &str, old: Option<Rc<Message>>, removed: bool);
    fn index_changed(&mut self, node: &NodeRef, path: &str, op: IndexOp);
}

/// Sink that discards every notification.
pub struct NullSink;

impl ChangeSink for NullSink {
    fn node_created(&mut self, _node: &NodeRef, _path: &str) {}
    fn node_changed(&mut self, _: &NodeRef, _: &str, _: Option<Rc<Message>>, _: bool) {}
    fn index_changed(&mut self, _: &NodeRef, _: &str, _: IndexOp) {}
}

#[derive(Debug, Default)]
pub struct DataNode {
    name: String,
    parent: NodeWeak,
    depth: u32,
    payload: Option<Rc<Message>>,
    children: HashMap<String, NodeRef>,
    // Optional ordering over a subset of the children.
    index: Option<Vec<NodeRef>>,
    // session id -> subscription hit count; entries are dropped at zero.
    subscribers: HashMap<u32, u32>,
    // 0 means "recompute on demand".
    cached_checksum: Cell<u32>,
    max_child_id_hint: u32,
    auto_name_counter: u32,
}

impl Recycle for NodeCell {
    fn reset(&mut self) {
        let node = self.get_mut();
        node.name.clear();
        node.parent = Weak::new();
        node.depth = 0;
        node.payload = None;
        node.children.clear();
        node.index = None;
        node.subscribers.clear();
        node.cached_checksum.set(0);
        node.max_child_id_hint = 0;
        node.auto_name_counter = 0;
    }
}

impl DataNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn payload(&self) -> Option<&Rc<Message>> {
        self.payload.as_ref()
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.upgrade()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn child(&self, name: &str) -> Option<NodeRef> {
        self.children.get(name).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child_refs(&self) -> Vec<NodeRef> {
        self.children.values().cloned().collect()
    }

    pub fn index(&self) -> Option<&[NodeRef]> {
        self.index.as_deref()
    }

    pub fn index_len(&self) -> usize {
        self.index.as_ref().map_or(0, Vec::len)
    }

    pub fn subscriber_sessions(&self) -> Vec<u32> {
        self.subscribers.keys().copied().collect()
    }

    pub fn subscriber_count(&self, session_id: u32) -> u32 {
        self.subscribers.get(&session_id).copied().unwrap_or(0)
    }

    pub fn increment_subscriber(&mut self, session_id: u32) {
        *self.subscribers.entry(session_id).or_insert(0) += 1;
    }

    pub fn decrement_subscriber(&mut self, session_id: u32) {
        if let Some(count) = self.subscribers.get_mut(&session_id) {
            *count -= 1;
            if *count == 0 {
                self.subscribers.remove(&session_id);
            }
        }
    }

    pub fn max_child_id_hint(&self) -> u32 {
        self.max_child_id_hint
    }

    /// Checksum of name plus payload, recursing `max_depth` levels into
    /// indexed names and children.  The local part is cached per node.
    pub fn checksum(&self, max_depth: u32) -> u32 {
        if self.cached_checksum.get() == 0 {
            let mut local = rolling_checksum(0, self.name.as_bytes());
            if let Some(payload) = &self.payload {
                local = local.wrapping_add(payload.checksum());
            }
            self.cached_checksum.set(local);
        }
        let mut total = self.cached_checksum.get();
        if max_depth > 0 {
            if let Some(index) = &self.index {
                for entry in index {
                    total =
                        total.wrapping_add(rolling_checksum(0, entry.borrow().name.as_bytes()));
                }
            }
            for child in self.children.values() {
                total = total.wrapping_add(child.borrow().checksum(max_depth - 1));
            }
        }
        total
    }
}

/// Draws a node from the pool and initializes it.
pub fn new_node(pool: &NodePool, name: &str, payload: Option<Rc<Message>>) -> NodeRef {
    let node = Rc::new(pool.obtain());
    {
        let mut inner = node.borrow_mut();
        inner.name = name.to_owned();
        inner.payload = payload;
    }
    node
}

/// Absolute path of a node; the tree root renders as `/`.
pub fn node_path(node: &NodeRef) -> String {
    node_path_from_depth(node, 0)
}

/// Path rendered from `start_depth` downward; for nonzero start depths the
/// result carries no leading slash.
pub fn node_path_from_depth(node: &NodeRef, start_depth: u32) -> String {
    let mut names = Vec::new();
    let mut cursor = node.clone();
    loop {
        let parent = {
            let inner = cursor.borrow();
            if inner.depth < start_depth.max(1) {
                break;
            }
            names.push(inner.name.clone());
            inner.parent()
        };
        match parent {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    names.reverse();
    if start_depth == 0 {
        format!("/{}", names.join("/"))
    } else {
        names.join("/")
    }
}

pub fn root_of(node: &NodeRef) -> NodeRef {
    let mut cursor = node.clone();
    loop {
        let parent = cursor.borrow().parent();
        match parent {
            Some(parent) => cursor = parent,
            None => return cursor,
        }
    }
}

// "Scan leading digits, zero on none" over an optional `I` prefix.
fn parsed_id_hint(name: &str) -> u32 {
    let digits = name.strip_prefix('I').unwrap_or(name);
    let run: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    if run.is_empty() {
        0
    } else {
        run.parse().unwrap_or(u32::MAX)
    }
}

fn set_parent(child: &NodeRef, parent: Option<&NodeRef>, sink: &mut dyn ChangeSink) {
    let had_parent = child.borrow().parent().is_some();
    match parent {
        Some(parent) => {
            if had_parent {
                tracing::warn!(
                    node = %child.borrow().name(),
                    "overwriting previous parent link"
                );
            }
            let (parent_depth, child_name) = {
                let name = child.borrow().name.clone();
                (parent.borrow().depth, name)
            };
            {
                let mut p = parent.borrow_mut();
                p.max_child_id_hint = p.max_child_id_hint.max(parsed_id_hint(&child_name));
            }
            {
                let mut c = child.borrow_mut();
                c.parent = Rc::downgrade(parent);
                c.depth = parent_depth + 1;
            }
            refresh_descendant_depths(child);
            let path = node_path(child);
            sink.node_created(child, &path);
        }
        None => {
            let mut c = child.borrow_mut();
            c.parent = Weak::new();
            c.depth = 0;
            c.subscribers.clear();
        }
    }
}

// A reattached subtree keeps its internal shape; only depths need fixing.
fn refresh_descendant_depths(node: &NodeRef) {
    let (depth, children) = {
        let inner = node.borrow();
        (inner.depth, inner.child_refs())
    };
    for child in children {
        child.borrow_mut().depth = depth + 1;
        refresh_descendant_depths(&child);
    }
}

/// Inserts or replaces `child` under `parent`.  The new-node notification
/// fires from the parent link; a replacement additionally reports the old
/// payload as changed data when `notify_changed` is set.
pub fn put_child(
    parent: &NodeRef,
    child: NodeRef,
    sink: &mut dyn ChangeSink,
    notify_changed: bool,
) -> Result<()> {
    let name = child.borrow().name.clone();
    if name.is_empty() {
        return Err(ReflectError::BadArgument("child node has no name".into()));
    }
    set_parent(&child, Some(parent), sink);
    let old = parent.borrow_mut().children.insert(name, child.clone());
    if notify_changed {
        let old_payload = old.and_then(|old| old.borrow().payload.clone());
        let path = node_path(&child);
        sink.node_changed(&child, &path, old_payload, false);
    }
    Ok(())
}

/// Removes the named child.  With `recurse`, descendants go depth-first
/// before the child itself; every removed node is reported.  `removed`
/// counts the nodes that went away.
pub fn remove_child(
    parent: &NodeRef,
    name: &str,
    sink: &mut dyn ChangeSink,
    recurse: bool,
    removed: &mut u32,
) -> Result<()> {
    let child = parent
        .borrow()
        .child(name)
        .ok_or_else(|| ReflectError::DataNotFound(name.to_owned()))?;

    if recurse {
        loop {
            let next = child.borrow().children.keys().next().cloned();
            match next {
                Some(grandchild) => remove_child(&child, &grandchild, sink, true, removed)?,
                None => break,
            }
        }
    }

    let _ = remove_index_entry(parent, name, sink);
    {
        let path = node_path(&child);
        let payload = child.borrow().payload.clone();
        sink.node_changed(&child, &path, payload, true);
    }
    set_parent(&child, None, sink);
    parent.borrow_mut().children.remove(name);
    *removed += 1;
    Ok(())
}

/// Replaces the node's payload.  A creation-time call suppresses the old
/// payload in the notification.
pub fn set_data(
    node: &NodeRef,
    payload: Option<Rc<Message>>,
    sink: &mut dyn ChangeSink,
    is_being_created: bool,
) {
    let old = {
        let mut inner = node.borrow_mut();
        let old = if is_being_created {
            None
        } else {
            inner.payload.clone()
        };
        inner.payload = payload;
        inner.cached_checksum.set(0);
        old
    };
    let path = node_path(node);
    sink.node_changed(node, &path, old, false);
}

/// Creates a child and places it in the ordered index, synthesizing an
/// `I<counter>` name when none is given.
pub fn insert_ordered_child(
    parent: &NodeRef,
    pool: &NodePool,
    payload: Option<Rc<Message>>,
    before: Option<&str>,
    name: Option<&str>,
    sink: &mut dyn ChangeSink,
) -> Result<NodeRef> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => synthesize_child_name(parent),
    };
    let child = new_node(pool, &name, payload);

    let insert_at = {
        let mut inner = parent.borrow_mut();
        let index = inner.index.get_or_insert_with(Vec::new);
        position_before(index, before).unwrap_or(index.len())
    };

    put_child(parent, child.clone(), sink, false)?;
    {
        let mut inner = parent.borrow_mut();
        let index = inner.index.as_mut().expect("index created above");
        index.insert(insert_at, child.clone());
    }
    let parent_path = node_path(parent);
    sink.index_changed(
        parent,
        &parent_path,
        IndexOp::Inserted {
            pos: insert_at as u32,
            name,
        },
    );
    Ok(child)
}

fn synthesize_child_name(parent: &NodeRef) -> String {
    let mut inner = parent.borrow_mut();
    // Start past both our own counter and the highest id seen among existing
    // children, so re-opened trees never reissue an old auto-name.
    let mut candidate = inner.auto_name_counter.max(match inner.max_child_id_hint {
        0 => 0,
        hint => hint.saturating_add(1),
    });
    loop {
        let name = format!("I{candidate}");
        if !inner.children.contains_key(&name) {
            inner.auto_name_counter = candidate + 1;
            return name;
        }
        candidate += 1;
    }
}

fn position_before(index: &[NodeRef], before: Option<&str>) -> Option<usize> {
    let target = before?;
    index
        .iter()
        .rposition(|entry| entry.borrow().name == target)
}

/// Adds an existing child into the ordered index at `pos`.
pub fn insert_index_entry_at(
    parent: &NodeRef,
    pos: u32,
    name: &str,
    sink: &mut dyn ChangeSink,
) -> Result<()> {
    let at = {
        let mut inner = parent.borrow_mut();
        if inner.children.is_empty() {
            return Err(ReflectError::BadObject("node has no children to index"));
        }
        let child = inner
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| ReflectError::DataNotFound(name.to_owned()))?;
        let index = inner.index.get_or_insert_with(Vec::new);
        let at = (pos as usize).min(index.len());
        index.insert(at, child);
        at
    };
    let path = node_path(parent);
    sink.index_changed(
        parent,
        &path,
        IndexOp::Inserted {
            pos: at as u32,
            name: name.to_owned(),
        },
    );
    Ok(())
}

/// Removes the index entry at `pos`; the child node itself stays.
pub fn remove_index_entry_at(parent: &NodeRef, pos: u32, sink: &mut dyn ChangeSink) -> Result<()> {
    let name = {
        let mut inner = parent.borrow_mut();
        let index = inner
            .index
            .as_mut()
            .ok_or_else(|| ReflectError::DataNotFound(format!("index position {pos}")))?;
        if pos as usize >= index.len() {
            return Err(ReflectError::DataNotFound(format!("index position {pos}")));
        }
        let entry = index.remove(pos as usize);
        let name = entry.borrow().name.clone();
        name
    };
    let path = node_path(parent);
    sink.index_changed(parent, &path, IndexOp::Removed { pos, name });
    Ok(())
}

fn remove_index_entry(parent: &NodeRef, name: &str, sink: &mut dyn ChangeSink) -> Result<()> {
    let pos = {
        let mut inner = parent.borrow_mut();
        let Some(index) = inner.index.as_mut() else {
            return Err(ReflectError::DataNotFound(name.to_owned()));
        };
        match index.iter().rposition(|entry| entry.borrow().name == name) {
            Some(pos) => {
                index.remove(pos);
                pos
            }
            None => return Err(ReflectError::DataNotFound(name.to_owned())),
        }
    };
    let path = node_path(parent);
    sink.index_changed(
        parent,
        &path,
        IndexOp::Removed {
            pos: pos as u32,
            name: name.to_owned(),
        },
    );
    Ok(())
}

/// Moves an indexed child to just before `before`, or to the end.  A child
/// that was not in the index is simply inserted, with no removal event.
pub fn reorder_child(
    parent: &NodeRef,
    child_name: &str,
    before: Option<&str>,
    sink: &mut dyn ChangeSink,
) -> Result<()> {
    if child_name.is_empty() {
        return Err(ReflectError::BadArgument("no child named".into()));
    }
    {
        let inner = parent.borrow();
        if inner.index.is_none() {
            return Err(ReflectError::DataNotFound("node has no ordered index".into()));
        }
        if !inner.has_child(child_name) {
            return Err(ReflectError::DataNotFound(child_name.to_owned()));
        }
    }
    if before == Some(child_name) {
        return Ok(()); // moving before itself is a no-op
    }

    let _ = remove_index_entry(parent, child_name, sink);

    let at = {
        let mut inner = parent.borrow_mut();
        let child = inner.children.get(child_name).cloned().expect("checked above");
        let index = inner.index.as_mut().expect("checked above");
        let at = match before {
            Some(target) if inner_has(index, target) => {
                position_before(index, Some(target)).expect("checked by inner_has")
            }
            _ => index.len(),
        };
        index.insert(at, child);
        at
    };
    let path = node_path(parent);
    sink.index_changed(
        parent,
        &path,
        IndexOp::Inserted {
            pos: at as u32,
            name: child_name.to_owned(),
        },
    );
    Ok(())
}

fn inner_has(index: &[NodeRef], name: &str) -> bool {
    index.iter().any(|entry| entry.borrow().name == name)
}

/// Resolves a path to the first matching node.  Empty path names the node
/// itself; a leading `/` restarts from the root; wildcard segments iterate
/// the child map.  `max_depth` prunes recursion at zero.
pub fn find_first_matching_node(node: &NodeRef, path: &str, max_depth: u32) -> Option<NodeRef> {
    if path.is_empty() {
        return Some(node.clone());
    }
    if let Some(rest) = path.strip_prefix('/') {
        return find_first_matching_node(&root_of(node), rest, max_depth);
    }
    if max_depth == 0 {
        return None;
    }
    let (segment, rest) = match path.split_once('/') {
        Some((segment, rest)) => (segment, rest),
        None => (path, ""),
    };
    if has_wildcards(segment) {
        let matcher = SegmentMatcher::parse(segment).ok()?;
        let children = node.borrow().child_refs();
        for child in children {
            let hit = matcher.matches(child.borrow().name());
            if hit {
                if let Some(found) = find_first_matching_node(&child, rest, max_depth - 1) {
                    return Some(found);
                }
            }
        }
        None
    } else {
        let child = node.borrow().child(segment)?;
        find_first_matching_node(&child, rest, max_depth - 1)
    }
}

/// Direct descendant lookup; no wildcard interpretation.
pub fn get_descendant(node: &NodeRef, path: &str) -> Option<NodeRef> {
    let mut cursor = node.clone();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = cursor.borrow().child(segment)?;
        cursor = next;
    }
    Some(cursor)
}

/// Calls `visit` on every node matching the segment list, walking literal
/// segments by direct lookup and wildcard segments by iteration.  The
/// visitor must not restructure the ancestor chain.
pub fn visit_matching(
    node: &NodeRef,
    segments: &[SegmentMatcher],
    visit: &mut dyn FnMut(&NodeRef),
) {
    let Some((first, rest)) = segments.split_first() else {
        visit(node);
        return;
    };
    if let Some(name) = first.literal() {
        let child = node.borrow().child(name);
        if let Some(child) = child {
            visit_matching(&child, rest, visit);
        }
        return;
    }
    let children = node.borrow().child_refs();
    for child in children {
        let hit = first.matches(child.borrow().name());
        if hit {
            visit_matching(&child, rest, visit);
        }
    }
}

/// Debug rendering of a subtree, one node per line.
pub fn render_tree(node: &NodeRef, max_depth: u32) -> String {
    let mut out = String::new();
    render_into(node, max_depth, 0, &mut out);
    out
}

fn render_into(node: &NodeRef, max_depth: u32, indent: usize, out: &mut String) {
    let inner = node.borrow();
    out.push_str(&" ".repeat(indent));
    out.push_str(&format!(
        "[{}] children={} index={} checksum={}\n",
        inner.name(),
        inner.child_count(),
        inner
            .index
            .as_ref()
            .map_or_else(|| "-".to_owned(), |i| i.len().to_string()),
        inner.checksum(0),
    ));
    if max_depth > 0 {
        for child in inner.children.values() {
            render_into(child, max_depth - 1, indent + 2, out);
        }
    }
}
