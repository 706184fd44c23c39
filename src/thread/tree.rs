//! Arena-backed thread tree.
//!
//! Every board view is a single tree under a synthetic root. Nodes hold
//! either a real [`Record`] or a [`Placeholder`] standing in for an ancestor
//! that has not been loaded. Nodes live in a `Vec` and refer to each other
//! by [`NodeId`]; removed nodes leave a tombstone so ids stay stable for the
//! lifetime of the tree.
//!
//! An id index maps record ids to nodes for both records and placeholders,
//! which is what the merge path uses to find attachment points.

use crate::constants::{PLACEHOLDER_SUBJECT_CLOSE, PLACEHOLDER_SUBJECT_OPEN};
use crate::error::{Result, ThreadError};
use crate::record::{BoardId, Record, RecordId};
use std::collections::HashMap;

/// Stable handle of a node within one [`ThreadTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Returns the arena slot of this node.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Stand-in for an ancestor record that is not available yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Id of the missing record.
    pub id: RecordId,
    /// The part of the original ancestor chain above the missing record.
    pub parents: Vec<RecordId>,
    /// Display subject derived from the first real descendant.
    pub subject: Option<String>,
}

impl Placeholder {
    /// Creates a placeholder for `id` whose own ancestors are `parents`.
    pub fn new(id: RecordId, parents: Vec<RecordId>) -> Self {
        Self {
            id,
            parents,
            subject: None,
        }
    }
}

/// Payload of a tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    /// The synthetic root of a board view.
    Root,
    /// A loaded record.
    Record(Record),
    /// A missing ancestor.
    Placeholder(Placeholder),
}

impl NodeContent {
    /// Returns the record id carried by this node, if any.
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            NodeContent::Root => None,
            NodeContent::Record(record) => record.id.as_ref(),
            NodeContent::Placeholder(placeholder) => Some(&placeholder.id),
        }
    }

    /// Returns the record if this is a real record node.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            NodeContent::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Returns the placeholder if this is a placeholder node.
    pub fn as_placeholder(&self) -> Option<&Placeholder> {
        match self {
            NodeContent::Placeholder(placeholder) => Some(placeholder),
            _ => None,
        }
    }

    /// Returns true for placeholder nodes.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, NodeContent::Placeholder(_))
    }
}

/// A node together with its links.
#[derive(Debug, Clone)]
pub struct TreeNode {
    content: NodeContent,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl TreeNode {
    /// Returns the node payload.
    pub fn content(&self) -> &NodeContent {
        &self.content
    }

    /// Returns the parent, `None` for the root and for detached nodes.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the children in insertion order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns true if the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Aggregated counters over the records of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Number of unread records.
    pub unread: usize,
    /// Any record is flagged.
    pub has_flagged: bool,
    /// Any record is starred.
    pub has_starred: bool,
    /// Number of real records.
    pub records: usize,
    /// Number of placeholders.
    pub placeholders: usize,
}

/// A board's thread tree.
#[derive(Debug, Clone)]
pub struct ThreadTree {
    board: BoardId,
    nodes: Vec<Option<TreeNode>>,
    index: HashMap<RecordId, NodeId>,
    build_id: u64,
    version: u64,
}

impl ThreadTree {
    /// Creates an empty tree for a board.
    pub fn new(board: BoardId) -> Self {
        let root = TreeNode {
            content: NodeContent::Root,
            parent: None,
            children: Vec::new(),
        };
        Self {
            board,
            nodes: vec![Some(root)],
            index: HashMap::new(),
            build_id: 0,
            version: 0,
        }
    }

    /// Returns the board this tree belongs to.
    pub fn board(&self) -> &BoardId {
        &self.board
    }

    /// Returns the root node id.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Returns the id of the rebuild that produced this tree.
    pub fn build_id(&self) -> u64 {
        self.build_id
    }

    pub(crate) fn set_build_id(&mut self, build_id: u64) {
        self.build_id = build_id;
    }

    /// Returns the modification counter, bumped by merges and read-state changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Returns a live node.
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Returns the payload of a live node.
    pub fn content(&self, id: NodeId) -> Option<&NodeContent> {
        self.get(id).map(TreeNode::content)
    }

    /// Returns the record of a live record node.
    pub fn record(&self, id: NodeId) -> Option<&Record> {
        self.content(id).and_then(NodeContent::as_record)
    }

    /// Returns the children of a node, empty for unknown nodes.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(TreeNode::children).unwrap_or(&[])
    }

    /// Returns the parent of a node.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(TreeNode::parent)
    }

    /// Returns the number of nodes below the root.
    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count() - 1
    }

    /// Returns true if the root has no descendants.
    pub fn is_empty(&self) -> bool {
        self.children(self.root()).is_empty()
    }

    /// Finds the node (record or placeholder) carrying a record id.
    pub fn find(&self, id: &RecordId) -> Option<NodeId> {
        self.index.get(id).copied()
    }

    /// Finds a placeholder for a record id.
    pub fn find_placeholder(&self, id: &RecordId) -> Option<NodeId> {
        self.find(id)
            .filter(|node| self.content(*node).is_some_and(NodeContent::is_placeholder))
    }

    /// Finds a real record node for a record id.
    pub fn find_record(&self, id: &RecordId) -> Option<NodeId> {
        self.find(id)
            .filter(|node| self.record(*node).is_some())
    }

    /// Inserts a node without linking it to a parent.
    ///
    /// Content with a record id is indexed; a later node with the same id
    /// shadows the earlier one in the index.
    pub fn insert_detached(&mut self, content: NodeContent) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(record_id) = content.record_id() {
            self.index.insert(record_id.clone(), id);
        }
        self.nodes.push(Some(TreeNode {
            content,
            parent: None,
            children: Vec::new(),
        }));
        id
    }

    /// Links a detached node under `parent`.
    ///
    /// Fails if either node is unknown, the child is already linked, or the
    /// link would make the child its own ancestor.
    pub fn attach(&mut self, child: NodeId, parent: NodeId) -> Result<()> {
        if child == self.root() {
            return Err(ThreadError::invalid_input("root cannot be attached"));
        }
        match self.get(child) {
            Some(node) if node.parent.is_none() => {}
            Some(_) => return Err(ThreadError::invalid_input("node is already attached")),
            None => return Err(ThreadError::invalid_input("unknown child node")),
        }
        if self.get(parent).is_none() {
            return Err(ThreadError::invalid_input("unknown parent node"));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(ThreadError::malformed("ancestor chain forms a cycle"));
        }

        if let Some(node) = self.get_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
        Ok(())
    }

    /// Inserts `content` as the last child of `parent`.
    pub fn add_child(&mut self, parent: NodeId, content: NodeContent) -> Result<NodeId> {
        if self.get(parent).is_none() {
            return Err(ThreadError::invalid_input("unknown parent node"));
        }
        let id = self.insert_detached(content);
        self.attach(id, parent)?;
        Ok(id)
    }

    /// Returns true if `ancestor` is `node` or lies on its parent path.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Removes a leaf and returns its payload.
    pub fn remove_leaf(&mut self, id: NodeId) -> Option<NodeContent> {
        if id == self.root() || !self.get(id)?.is_leaf() {
            return None;
        }
        let node = self.nodes.get_mut(id.0)?.take()?;
        if let Some(parent) = node.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|c| *c != id);
        }
        if let Some(record_id) = node.content.record_id() {
            if self.index.get(record_id) == Some(&id) {
                self.index.remove(record_id);
            }
        }
        Some(node.content)
    }

    /// Swaps a placeholder for the record it stands for, keeping its position.
    ///
    /// Returns the replaced placeholder.
    pub fn fill_placeholder(&mut self, id: NodeId, record: Record) -> Result<Placeholder> {
        let node = self
            .get_mut(id)
            .ok_or_else(|| ThreadError::invalid_input("unknown node"))?;
        match node.content.as_placeholder() {
            Some(placeholder) if record.id.as_ref() == Some(&placeholder.id) => {}
            Some(_) => return Err(ThreadError::invalid_input("record id does not match")),
            None => return Err(ThreadError::invalid_input("node is not a placeholder")),
        }
        match std::mem::replace(&mut node.content, NodeContent::Record(record)) {
            NodeContent::Placeholder(placeholder) => Ok(placeholder),
            _ => Err(ThreadError::invalid_input("node is not a placeholder")),
        }
    }

    /// Gives mutable access to a record node.
    pub(crate) fn record_mut(&mut self, id: NodeId) -> Option<&mut Record> {
        match &mut self.get_mut(id)?.content {
            NodeContent::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Returns all nodes below the root that have no children.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(id, node)| *id != self.root() && node.is_leaf())
            .map(|(id, _)| id)
            .collect()
    }

    /// Iterates live nodes in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|n| (NodeId(i), n)))
    }

    /// Returns the nodes reachable from the root in depth-first pre-order.
    pub fn walk(&self) -> Vec<NodeId> {
        self.walk_from(self.root())
    }

    /// Returns `start` and its descendants in depth-first pre-order.
    pub fn walk_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if self.get(id).is_none() {
                continue;
            }
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    /// Returns the record ids of all real records, in walk order.
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.walk()
            .into_iter()
            .filter_map(|id| self.record(id).and_then(|r| r.id.clone()))
            .collect()
    }

    /// Returns the placeholder node ids, in walk order.
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|id| self.content(*id).is_some_and(NodeContent::is_placeholder))
            .collect()
    }

    /// Gives every placeholder a bracketed subject taken from its first real descendant.
    pub fn label_placeholders(&mut self) {
        for id in self.placeholders() {
            self.label(id);
        }
    }

    /// Relabels the placeholders between `node` and the root.
    ///
    /// Inserting a record can only change the labels of its own ancestors.
    pub fn label_path(&mut self, node: NodeId) {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.content(id).is_some_and(NodeContent::is_placeholder) {
                self.label(id);
            }
            current = self.parent(id);
        }
    }

    fn label(&mut self, id: NodeId) {
        let subject = self.first_subject(id);
        if let Some(NodeContent::Placeholder(placeholder)) =
            self.get_mut(id).map(|n| &mut n.content)
        {
            placeholder.subject = subject.map(|s| {
                format!("{}{}{}", PLACEHOLDER_SUBJECT_OPEN, s, PLACEHOLDER_SUBJECT_CLOSE)
            });
        }
    }

    /// Subject of the first real record at or below `start`, in walk order.
    fn first_subject(&self, start: NodeId) -> Option<String> {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if let Some(record) = self.record(id) {
                return Some(record.subject.clone());
            }
            stack.extend(self.children(id).iter().rev().copied());
        }
        None
    }

    /// Counts unread, flagged and starred records.
    pub fn stats(&self) -> ThreadStats {
        let mut stats = ThreadStats::default();
        for (_, node) in self.iter() {
            match &node.content {
                NodeContent::Record(record) => {
                    stats.records += 1;
                    if record.is_new {
                        stats.unread += 1;
                    }
                    stats.has_flagged |= record.is_flagged;
                    stats.has_starred |= record.is_starred;
                }
                NodeContent::Placeholder(_) => stats.placeholders += 1,
                NodeContent::Root => {}
            }
        }
        stats
    }
}
