//! Incremental insertion of a single record into an existing tree.

use crate::filter::FilterPolicy;
use crate::record::{Record, RecordId};
use crate::thread::tree::{NodeContent, NodeId, Placeholder, ThreadTree};
use std::fmt;
use tracing::{debug, warn};

/// Where a merged record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePlacement {
    /// Attached directly under the root.
    Root,
    /// Replaced the placeholder standing in for it.
    FilledPlaceholder,
    /// Attached below an existing node, through `placeholders` new placeholders.
    UnderAncestor {
        /// Id of the matched ancestor.
        ancestor: RecordId,
        /// Number of placeholders synthesized between the ancestor and the record.
        placeholders: usize,
    },
    /// Started a new thread under the root, topped by `placeholders` placeholders.
    NewThread {
        /// Length of the synthesized chain.
        placeholders: usize,
    },
    /// A record with the same id is already in the tree.
    Duplicate,
    /// Withheld by the filter policy.
    Blocked,
    /// The nearest ancestor id is malformed; the record was skipped.
    Malformed,
}

impl MergePlacement {
    /// Returns true if the record was inserted into the tree.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            MergePlacement::Root
                | MergePlacement::FilledPlaceholder
                | MergePlacement::UnderAncestor { .. }
                | MergePlacement::NewThread { .. }
        )
    }
}

impl fmt::Display for MergePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePlacement::Root => write!(f, "attached to root"),
            MergePlacement::FilledPlaceholder => write!(f, "filled placeholder"),
            MergePlacement::UnderAncestor {
                ancestor,
                placeholders: 0,
            } => write!(f, "attached under {}", ancestor),
            MergePlacement::UnderAncestor {
                ancestor,
                placeholders,
            } => write!(
                f,
                "attached under {} via {} placeholders",
                ancestor, placeholders
            ),
            MergePlacement::NewThread { placeholders } => {
                write!(f, "new thread with {} placeholders", placeholders)
            }
            MergePlacement::Duplicate => write!(f, "duplicate"),
            MergePlacement::Blocked => write!(f, "blocked"),
            MergePlacement::Malformed => write!(f, "malformed ancestor"),
        }
    }
}

/// Outcome of [`merge_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Where the record went.
    pub placement: MergePlacement,
    /// Node holding the record, if it was inserted.
    pub node: Option<NodeId>,
    /// Id whose read state must be cleared because the record was withheld unread.
    pub read_clear: Option<RecordId>,
}

impl MergeResult {
    fn skipped(placement: MergePlacement) -> Self {
        Self {
            placement,
            node: None,
            read_clear: None,
        }
    }
}

/// Folds one newly arrived record into `tree`.
///
/// A blocked record is never inserted, unlike a full build which inserts and
/// then prunes it. The store is not consulted: ancestors missing from the
/// tree become placeholders right away.
pub fn merge_record(
    tree: &mut ThreadTree,
    record: Record,
    policy: &FilterPolicy,
    threading: bool,
) -> MergeResult {
    let id = record.id.clone().filter(RecordId::is_valid);

    if let Some(id) = &id {
        if tree.find_record(id).is_some() {
            debug!("Record {} already present in board {}", id, tree.board());
            return MergeResult::skipped(MergePlacement::Duplicate);
        }
    }

    if policy.is_blocked(&record) {
        let read_clear = if record.is_new { id } else { None };
        return MergeResult {
            placement: MergePlacement::Blocked,
            node: None,
            read_clear,
        };
    }

    let result = place(tree, record, id, threading);
    if let Some(node) = result.node {
        tree.label_path(node);
        tree.bump_version();
    }
    result
}

fn place(
    tree: &mut ThreadTree,
    record: Record,
    id: Option<RecordId>,
    threading: bool,
) -> MergeResult {
    let root = tree.root();

    let id = match id {
        Some(id) if threading => id,
        _ => return attach(tree, root, record, MergePlacement::Root),
    };

    // A thread root may already be represented by a placeholder from its replies
    if let Some(placeholder) = tree.find_placeholder(&id) {
        return match tree.fill_placeholder(placeholder, record) {
            Ok(_) => MergeResult {
                placement: MergePlacement::FilledPlaceholder,
                node: Some(placeholder),
                read_clear: None,
            },
            Err(e) => {
                warn!("Failed to fill placeholder {}: {}", id, e);
                MergeResult::skipped(MergePlacement::Malformed)
            }
        };
    }

    // A chain naming the record itself is cyclic above that point
    let chain = match record.parents.iter().rposition(|p| *p == id) {
        Some(own) => record.parents[own + 1..].to_vec(),
        None => record.parents.clone(),
    };
    if chain.is_empty() {
        return attach(tree, root, record, MergePlacement::Root);
    }

    if chain.last().is_some_and(|p| !p.is_valid()) {
        warn!("Skipping {}: malformed parent id", id);
        return MergeResult::skipped(MergePlacement::Malformed);
    }

    // Nearest ancestor already in the tree, if any
    let matched = chain
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, ancestor)| ancestor.is_valid())
        .find_map(|(position, ancestor)| tree.find(ancestor).map(|node| (position, node)));

    let (mut parent, first_missing) = match matched {
        Some((position, node)) => (node, position + 1),
        None => (root, 0),
    };

    let mut created = 0;
    for position in first_missing..chain.len() {
        let ancestor = &chain[position];
        if !ancestor.is_valid() {
            continue;
        }
        let placeholder = Placeholder::new(ancestor.clone(), chain[..position].to_vec());
        match tree.add_child(parent, NodeContent::Placeholder(placeholder)) {
            Ok(node) => {
                parent = node;
                created += 1;
            }
            Err(e) => warn!("Failed to add placeholder {}: {}", ancestor, e),
        }
    }

    let placement = match matched {
        Some((position, _)) => MergePlacement::UnderAncestor {
            ancestor: chain[position].clone(),
            placeholders: created,
        },
        None => MergePlacement::NewThread {
            placeholders: created,
        },
    };
    attach(tree, parent, record, placement)
}

fn attach(
    tree: &mut ThreadTree,
    parent: NodeId,
    record: Record,
    placement: MergePlacement,
) -> MergeResult {
    match tree.add_child(parent, NodeContent::Record(record)) {
        Ok(node) => MergeResult {
            placement,
            node: Some(node),
            read_clear: None,
        },
        Err(e) => {
            warn!("Failed to attach merged record: {}", e);
            MergeResult::skipped(MergePlacement::Malformed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterConfig, KeywordRule};
    use crate::record::BoardId;

    fn id(s: &str) -> RecordId {
        RecordId::new(s)
    }

    fn tree() -> ThreadTree {
        ThreadTree::new(BoardId::new("b"))
    }

    fn parent_id(tree: &ThreadTree, record: &str) -> Option<RecordId> {
        let node = tree.find(&id(record))?;
        tree.content(tree.parent(node)?)?.record_id().cloned()
    }

    #[test]
    fn test_root_placements() {
        let mut tree = tree();
        let policy = FilterPolicy::default();

        let result = merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);
        assert_eq!(result.placement, MergePlacement::Root);

        let result = merge_record(&mut tree, Record::without_id("b"), &policy, true);
        assert_eq!(result.placement, MergePlacement::Root);

        let result = merge_record(&mut tree, Record::new("b", "m2", &["m1"]), &policy, false);
        assert_eq!(result.placement, MergePlacement::Root);
        assert_eq!(tree.children(tree.root()).len(), 3);
        assert_eq!(tree.version(), 3);
    }

    #[test]
    fn test_fill_placeholder() {
        let mut tree = tree();
        let policy = FilterPolicy::default();

        let first = merge_record(&mut tree, Record::new("b", "m2", &["m1"]), &policy, true);
        assert_eq!(first.placement, MergePlacement::NewThread { placeholders: 1 });
        let placeholder = tree.find_placeholder(&id("m1")).unwrap();

        let result = merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);
        assert_eq!(result.placement, MergePlacement::FilledPlaceholder);
        assert_eq!(result.node, Some(placeholder));
        assert_eq!(tree.find_record(&id("m1")), Some(placeholder));
        assert_eq!(tree.placeholders().len(), 0);
        assert_eq!(parent_id(&tree, "m2"), Some(id("m1")));
    }

    #[test]
    fn test_thread_root_fills_placeholder() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        merge_record(&mut tree, Record::new("b", "m2", &["m1"]), &policy, true);

        let result = merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);
        assert_eq!(result.placement, MergePlacement::FilledPlaceholder);
        assert_eq!(tree.children(tree.root()).len(), 1);
    }

    #[test]
    fn test_under_nearest_ancestor() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);

        let result = merge_record(
            &mut tree,
            Record::new("b", "m4", &["m1", "m2", "m3"]),
            &policy,
            true,
        );
        assert_eq!(
            result.placement,
            MergePlacement::UnderAncestor {
                ancestor: id("m1"),
                placeholders: 2
            }
        );
        assert_eq!(parent_id(&tree, "m2"), Some(id("m1")));
        assert_eq!(parent_id(&tree, "m3"), Some(id("m2")));
        assert_eq!(parent_id(&tree, "m4"), Some(id("m3")));

        let m3 = tree.find_placeholder(&id("m3")).unwrap();
        let placeholder = tree.content(m3).and_then(NodeContent::as_placeholder).unwrap();
        assert_eq!(placeholder.parents, vec![id("m1"), id("m2")]);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);
        let version = tree.version();

        let result = merge_record(&mut tree, Record::new("b", "m1", &[]), &policy, true);
        assert_eq!(result.placement, MergePlacement::Duplicate);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.version(), version);
    }

    #[test]
    fn test_blocked_is_withheld() {
        let mut tree = tree();
        let policy = FilterPolicy::new(FilterConfig {
            subject: KeywordRule::new("spam"),
            ..Default::default()
        });

        let result = merge_record(
            &mut tree,
            Record::new("b", "m1", &["gone"]).with_subject("SPAM offer"),
            &policy,
            true,
        );
        assert_eq!(result.placement, MergePlacement::Blocked);
        assert_eq!(result.read_clear, Some(id("m1")));
        assert!(tree.is_empty());

        let result = merge_record(
            &mut tree,
            Record::new("b", "m2", &[]).with_subject("spam").read(),
            &policy,
            true,
        );
        assert_eq!(result.read_clear, None);
    }

    #[test]
    fn test_malformed_parent() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        let result = merge_record(&mut tree, Record::new("b", "m1", &[" "]), &policy, true);
        assert_eq!(result.placement, MergePlacement::Malformed);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_placeholder_subject_label() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        merge_record(
            &mut tree,
            Record::new("b", "m2", &["m1"]).with_subject("Re: news"),
            &policy,
            true,
        );
        let placeholder = tree.find_placeholder(&id("m1")).unwrap();
        assert_eq!(
            tree.content(placeholder)
                .and_then(NodeContent::as_placeholder)
                .and_then(|p| p.subject.clone()),
            Some("[Re: news]".to_string())
        );
    }

    #[test]
    fn test_self_reference_matches_build() {
        use crate::scheduler::{RebuildRequest, Window};
        use crate::store::MemoryRecordStore;
        use crate::thread::build_tree;

        let policy = FilterPolicy::default();
        let looped = Record::new("b", "m1", &["m1"]);

        let mut merged = tree();
        let result = merge_record(&mut merged, looped.clone(), &policy, true);
        assert_eq!(result.placement, MergePlacement::Root);
        assert!(merged.placeholders().is_empty());
        assert_eq!(merged.find(&id("m1")), merged.find_record(&id("m1")));

        let store = MemoryRecordStore::new();
        store.insert(looped);
        let built = build_tree(
            &store,
            &policy,
            true,
            &RebuildRequest::new("b", Window::default()),
        )
        .unwrap()
        .tree;
        let node = built.find_record(&id("m1")).unwrap();
        assert_eq!(built.parent(node), Some(built.root()));

        // Only the part of the chain below the self-reference is used
        let result = merge_record(
            &mut merged,
            Record::new("b", "m2", &["x", "m2", "m1"]),
            &policy,
            true,
        );
        assert_eq!(
            result.placement,
            MergePlacement::UnderAncestor {
                ancestor: id("m1"),
                placeholders: 0
            }
        );
        assert!(merged.find(&id("x")).is_none());
    }

    #[test]
    fn test_merge_relabels_existing_chain() {
        let mut tree = tree();
        let policy = FilterPolicy::default();
        merge_record(
            &mut tree,
            Record::new("b", "m3", &["m1", "m2"]).with_subject("late"),
            &policy,
            true,
        );
        let m1 = tree.find_placeholder(&id("m1")).unwrap();

        // m2 fills its placeholder, so m1 now takes its label from m2
        merge_record(
            &mut tree,
            Record::new("b", "m2", &["m1"]).with_subject("early"),
            &policy,
            true,
        );
        assert_eq!(
            tree.content(m1)
                .and_then(NodeContent::as_placeholder)
                .and_then(|p| p.subject.clone()),
            Some("[early]".to_string())
        );
    }

    #[test]
    fn test_placement_display() {
        assert_eq!(MergePlacement::Root.to_string(), "attached to root");
        assert_eq!(
            MergePlacement::UnderAncestor {
                ancestor: id("m1"),
                placeholders: 2
            }
            .to_string(),
            "attached under m1 via 2 placeholders"
        );
    }
}
