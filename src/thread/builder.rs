//! Full thread reconstruction for one board.
//!
//! The builder streams a board's window from the [`RecordStore`] and turns
//! the flat records into a [`ThreadTree`]:
//!
//! 1. Records without an id go straight under the root (if not blocked).
//! 2. Ancestor ids that are not in the window are fetched by id; ids the
//!    store does not have become [`Placeholder`]s carrying the rest of the
//!    chain. This repeats until a pass adds nothing.
//! 3. Every record and placeholder is attached under its nearest ancestor.
//! 4. Leaves that are placeholders or blocked records are pruned, again and
//!    again, until a pass prunes nothing.
//! 5. Surviving placeholders get a display subject and the counters are
//!    collected.
//!
//! Store failures and malformed ancestor ids are logged and skipped; the only
//! way a build ends without a tree is cancellation.

use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::record::{BoardId, Record, RecordId};
use crate::scheduler::{CancellationToken, RebuildRequest};
use crate::store::{RecordStore, StreamControl};
use crate::thread::tree::{NodeContent, NodeId, Placeholder, ThreadStats, ThreadTree};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Counters describing what a build did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Records delivered by the window stream.
    pub streamed: usize,
    /// Ancestors loaded by id.
    pub fetched: usize,
    /// Placeholders synthesized for missing ancestors.
    pub placeholders_created: usize,
    /// Nodes removed by the cascading prune.
    pub pruned: usize,
    /// Records skipped because of a malformed parent id.
    pub skipped_malformed: usize,
    /// Records dropped because their id was already seen.
    pub duplicates: usize,
    /// Store failures that were recovered from.
    pub store_errors: usize,
    /// Ancestor resolution passes, including the final empty one.
    pub resolution_passes: usize,
    /// Prune passes, including the final empty one.
    pub prune_passes: usize,
}

/// Result of a completed build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// The finished tree.
    pub tree: ThreadTree,
    /// Counters over the surviving records.
    pub stats: ThreadStats,
    /// Node of the prior selection, if it survived.
    pub selection: Option<NodeId>,
    /// Unread records hidden by the filter whose read state must be cleared.
    pub read_clears: Vec<RecordId>,
    /// What the build did.
    pub report: BuildReport,
}

/// A record or placeholder waiting to be attached.
enum Pending {
    Record(Record),
    Placeholder(Placeholder),
}

impl Pending {
    fn parents(&self) -> &[RecordId] {
        match self {
            Pending::Record(record) => &record.parents,
            Pending::Placeholder(placeholder) => &placeholder.parents,
        }
    }

    fn into_content(self) -> NodeContent {
        match self {
            Pending::Record(record) => NodeContent::Record(record),
            Pending::Placeholder(placeholder) => NodeContent::Placeholder(placeholder),
        }
    }
}

/// Builds board trees from a record store.
pub struct ThreadBuilder<'a> {
    store: &'a dyn RecordStore,
    policy: &'a FilterPolicy,
    threading: bool,
    token: CancellationToken,
}

impl<'a> ThreadBuilder<'a> {
    /// Creates a threaded builder that cannot be cancelled.
    pub fn new(store: &'a dyn RecordStore, policy: &'a FilterPolicy) -> Self {
        Self {
            store,
            policy,
            threading: true,
            token: CancellationToken::new(),
        }
    }

    /// Enables or disables threading. Without threading every record is a root child.
    pub fn threading(mut self, enabled: bool) -> Self {
        self.threading = enabled;
        self
    }

    /// Sets the token polled between passes.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Builds the tree for `request`.
    ///
    /// Returns `Err(ThreadError::Cancelled)` if the token fires; no other
    /// error is returned.
    pub fn build(&self, request: &RebuildRequest) -> Result<BuildOutput> {
        let mut report = BuildReport::default();
        let mut read_clears = Vec::new();
        let mut tree = ThreadTree::new(request.board.clone());

        let mut records = self.stream_window(request, &mut report);
        self.token.check()?;
        records.sort_by_key(|r| r.timestamp);

        if self.threading {
            self.build_threaded(&mut tree, records, &mut read_clears, &mut report)?;
        } else {
            self.build_flat(&mut tree, records, &mut read_clears);
        }

        tree.label_placeholders();
        let stats = tree.stats();
        let selection = request
            .prior_selection
            .as_ref()
            .and_then(|id| tree.find_record(id));

        debug!(
            "Built board {}: {} records, {} placeholders, {} unread ({:?})",
            request.board, stats.records, stats.placeholders, stats.unread, report
        );

        Ok(BuildOutput {
            tree,
            stats,
            selection,
            read_clears,
            report,
        })
    }

    /// Collects the window. A store failure ends the stream but keeps what arrived.
    fn stream_window(&self, request: &RebuildRequest, report: &mut BuildReport) -> Vec<Record> {
        let mut records = Vec::new();
        let token = &self.token;
        let result = self.store.stream_window(
            &request.board,
            request.window.max_age_days,
            &mut |record| {
                if token.is_cancelled() {
                    return StreamControl::Stop;
                }
                records.push(record);
                StreamControl::Continue
            },
        );
        if let Err(e) = result {
            warn!(
                "Loading board {} stopped after {} records: {}",
                request.board,
                records.len(),
                e
            );
            report.store_errors += 1;
        }
        report.streamed = records.len();
        records
    }

    fn build_flat(
        &self,
        tree: &mut ThreadTree,
        records: Vec<Record>,
        read_clears: &mut Vec<RecordId>,
    ) {
        let root = tree.root();
        for record in records {
            if self.policy.is_blocked(&record) {
                queue_read_clear(&record, read_clears);
                continue;
            }
            if let Err(e) = tree.add_child(root, NodeContent::Record(record)) {
                warn!("Failed to attach record: {}", e);
            }
        }
    }

    fn build_threaded(
        &self,
        tree: &mut ThreadTree,
        records: Vec<Record>,
        read_clears: &mut Vec<RecordId>,
        report: &mut BuildReport,
    ) -> Result<()> {
        let root = tree.root();
        let mut pending = Vec::with_capacity(records.len());
        let mut members: HashSet<RecordId> = HashSet::with_capacity(records.len());

        // Unreferenceable records never take part in threading
        for record in records {
            match record.id.clone().filter(RecordId::is_valid) {
                None => {
                    if self.policy.is_blocked(&record) {
                        continue;
                    }
                    if let Err(e) = tree.add_child(root, NodeContent::Record(record)) {
                        warn!("Failed to attach record without id: {}", e);
                    }
                }
                Some(id) => {
                    if members.insert(id) {
                        pending.push(Pending::Record(record));
                    } else {
                        report.duplicates += 1;
                    }
                }
            }
        }

        self.resolve_ancestors(tree.board(), &mut pending, &mut members, report)?;

        self.token.check()?;
        attach_all(tree, pending, report);

        self.prune(tree, read_clears, report)?;
        Ok(())
    }

    /// Closes the pending set over ancestry, fetching or synthesizing every
    /// ancestor id that is not already a member.
    fn resolve_ancestors(
        &self,
        board: &BoardId,
        pending: &mut Vec<Pending>,
        members: &mut HashSet<RecordId>,
        report: &mut BuildReport,
    ) -> Result<()> {
        let mut attempted: HashSet<RecordId> = HashSet::new();
        let mut start = 0;

        loop {
            self.token.check()?;
            report.resolution_passes += 1;

            // Only entries added by the previous pass have unexamined chains
            let end = pending.len();
            let mut additions = Vec::new();
            for entry in &pending[start..end] {
                let chain = entry.parents();
                for (position, ancestor) in chain.iter().enumerate().rev() {
                    if !ancestor.is_valid()
                        || members.contains(ancestor)
                        || !attempted.insert(ancestor.clone())
                    {
                        continue;
                    }
                    members.insert(ancestor.clone());
                    additions.push(self.load_ancestor(board, ancestor, &chain[..position], report));
                }
            }

            if additions.is_empty() {
                return Ok(());
            }
            start = end;
            pending.extend(additions);
        }
    }

    fn load_ancestor(
        &self,
        board: &BoardId,
        id: &RecordId,
        above: &[RecordId],
        report: &mut BuildReport,
    ) -> Pending {
        match self.store.fetch_by_id(board, id) {
            Ok(Some(record)) if record.id.as_ref() == Some(id) => {
                report.fetched += 1;
                return Pending::Record(record);
            }
            Ok(Some(_)) => warn!("Store returned a different record for {}", id),
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to load ancestor {} of board {}: {}", id, board, e);
                report.store_errors += 1;
            }
        }
        report.placeholders_created += 1;
        Pending::Placeholder(Placeholder::new(id.clone(), above.to_vec()))
    }

    /// Removes placeholder and blocked leaves until nothing changes.
    fn prune(
        &self,
        tree: &mut ThreadTree,
        read_clears: &mut Vec<RecordId>,
        report: &mut BuildReport,
    ) -> Result<()> {
        loop {
            self.token.check()?;
            report.prune_passes += 1;

            let mut removed = 0;
            for leaf in tree.leaves() {
                let prunable = match tree.content(leaf) {
                    Some(NodeContent::Placeholder(_)) => true,
                    Some(NodeContent::Record(record)) => self.policy.is_blocked(record),
                    _ => false,
                };
                if !prunable {
                    continue;
                }
                if let Some(NodeContent::Record(record)) = tree.remove_leaf(leaf) {
                    queue_read_clear(&record, read_clears);
                }
                removed += 1;
            }

            report.pruned += removed;
            if removed == 0 {
                return Ok(());
            }
        }
    }
}

/// Links every pending entry under its nearest ancestor.
fn attach_all(tree: &mut ThreadTree, pending: Vec<Pending>, report: &mut BuildReport) {
    let root = tree.root();
    let mut nodes = Vec::with_capacity(pending.len());

    for entry in pending {
        let parent = entry.parents().last().cloned();
        if parent.as_ref().is_some_and(|p| !p.is_valid()) {
            let content = entry.into_content();
            warn!(
                "Skipping {:?}: malformed parent id {:?}",
                content.record_id(),
                parent
            );
            report.skipped_malformed += 1;
            continue;
        }
        nodes.push((tree.insert_detached(entry.into_content()), parent));
    }

    for (node, parent_id) in nodes {
        let parent = match parent_id {
            None => root,
            Some(id) => tree.find(&id).unwrap_or_else(|| {
                // Parent was itself skipped as malformed
                let placeholder = Placeholder::new(id, Vec::new());
                tree.add_child(root, NodeContent::Placeholder(placeholder))
                    .unwrap_or(root)
            }),
        };
        if let Err(e) = tree.attach(node, parent) {
            warn!("Attaching {:?} under root instead: {}", node, e);
            if let Err(e) = tree.attach(node, root) {
                warn!("Failed to attach {:?}: {}", node, e);
            }
        }
    }
}

fn queue_read_clear(record: &Record, read_clears: &mut Vec<RecordId>) {
    if !record.is_new {
        return;
    }
    if let Some(id) = record.id.as_ref().filter(|id| id.is_valid()) {
        read_clears.push(id.clone());
    }
}

/// Builds a tree with a one-off builder.
pub fn build_tree(
    store: &dyn RecordStore,
    policy: &FilterPolicy,
    threading: bool,
    request: &RebuildRequest,
) -> Result<BuildOutput> {
    ThreadBuilder::new(store, policy)
        .threading(threading)
        .build(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThreadError;
    use crate::filter::{FilterConfig, KeywordRule};
    use crate::scheduler::Window;
    use crate::store::MemoryRecordStore;

    fn request() -> RebuildRequest {
        RebuildRequest::new("b", Window::default())
    }

    fn store_with(records: Vec<Record>) -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        store.insert_all(records);
        store
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s)
    }

    fn parent_id(tree: &ThreadTree, record: &str) -> Option<RecordId> {
        let node = tree.find(&id(record))?;
        let parent = tree.parent(node)?;
        tree.content(parent)?.record_id().cloned()
    }

    #[test]
    fn test_out_of_order_chain() {
        let now = crate::record::current_timestamp_millis();
        let store = store_with(vec![
            Record::new("b", "m3", &["m1", "m2"]).with_timestamp(now - 1),
            Record::new("b", "m1", &[]).with_timestamp(now - 3),
            Record::new("b", "m2", &["m1"]).with_timestamp(now - 2),
        ]);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;

        assert_eq!(tree.record_ids(), vec![id("m1"), id("m2"), id("m3")]);
        assert_eq!(parent_id(tree, "m1"), None);
        assert_eq!(parent_id(tree, "m2"), Some(id("m1")));
        assert_eq!(parent_id(tree, "m3"), Some(id("m2")));
        assert_eq!(output.stats.placeholders, 0);
        assert_eq!(output.stats.unread, 3);
        assert_eq!(store.fetch_count(), 0);
    }

    #[test]
    fn test_missing_parent_becomes_placeholder() {
        let store = store_with(vec![Record::new("b", "m5", &["missing1"]).with_subject("Hi")]);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;

        let placeholder = tree.find_placeholder(&id("missing1")).unwrap();
        assert_eq!(tree.parent(placeholder), Some(tree.root()));
        assert_eq!(parent_id(tree, "m5"), Some(id("missing1")));
        assert_eq!(
            tree.content(placeholder)
                .and_then(NodeContent::as_placeholder)
                .and_then(|p| p.subject.as_deref()),
            Some("[Hi]")
        );
        assert_eq!(output.report.placeholders_created, 1);
    }

    #[test]
    fn test_blocked_leaf_cascades_to_placeholder() {
        let store = store_with(vec![
            Record::new("b", "m5", &["missing1"]).with_body("casino"),
            Record::new("b", "other", &[]),
        ]);
        let policy = FilterPolicy::new(FilterConfig {
            body: KeywordRule::new("casino"),
            ..Default::default()
        });

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;

        assert!(tree.find(&id("m5")).is_none());
        assert!(tree.find(&id("missing1")).is_none());
        assert_eq!(tree.record_ids(), vec![id("other")]);
        assert_eq!(output.read_clears, vec![id("m5")]);
        assert_eq!(output.stats.unread, 1);
        assert!(output.report.prune_passes >= 3);
    }

    #[test]
    fn test_blocked_inner_record_survives() {
        let store = store_with(vec![
            Record::new("b", "m1", &[]).with_body("casino"),
            Record::new("b", "m2", &["m1"]),
        ]);
        let policy = FilterPolicy::new(FilterConfig {
            body: KeywordRule::new("casino"),
            ..Default::default()
        });

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        assert_eq!(parent_id(&output.tree, "m2"), Some(id("m1")));
        assert!(output.read_clears.is_empty());
    }

    #[test]
    fn test_ancestor_fetched_from_store() {
        let now = crate::record::current_timestamp_millis();
        let store = store_with(vec![
            Record::new("b", "old", &[]).with_timestamp(now - 30 * crate::constants::MILLIS_PER_DAY),
            Record::new("b", "reply", &["old"]),
        ]);
        store.set_now(now);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        assert_eq!(parent_id(&output.tree, "reply"), Some(id("old")));
        assert_eq!(output.report.fetched, 1);
        assert_eq!(output.report.streamed, 1);
    }

    #[test]
    fn test_placeholder_chain_follows_truncated_parents() {
        let store = store_with(vec![Record::new("b", "m4", &["a", "b", "c"])]);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;

        assert_eq!(parent_id(tree, "m4"), Some(id("c")));
        assert_eq!(parent_id(tree, "c"), Some(id("b")));
        assert_eq!(parent_id(tree, "b"), Some(id("a")));
        assert_eq!(parent_id(tree, "a"), None);
        assert_eq!(output.stats.placeholders, 3);
        // One lookup per missing id, never repeated
        assert_eq!(store.fetch_count(), 3);
    }

    #[test]
    fn test_store_failures_are_recovered() {
        let store = store_with(vec![
            Record::new("b", "m1", &["gone"]),
            Record::new("b", "m2", &[]),
        ]);
        store.fail_fetch("gone");
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        assert!(output.tree.find_placeholder(&id("gone")).is_some());
        assert_eq!(output.report.store_errors, 1);

        // The stream breaks after m1, whose ancestor lookup still fails
        store.fail_stream_after(Some(1));
        let output = build_tree(&store, &policy, true, &request()).unwrap();
        assert_eq!(output.report.streamed, 1);
        assert_eq!(output.report.store_errors, 2);
        assert!(output.tree.find(&id("m2")).is_none());
    }

    #[test]
    fn test_malformed_parent_is_skipped() {
        let store = store_with(vec![
            Record::new("b", "bad", &["m1", ""]),
            Record::new("b", "m1", &[]),
        ]);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        assert!(output.tree.find(&id("bad")).is_none());
        assert!(output.tree.find(&id("m1")).is_some());
        assert_eq!(output.report.skipped_malformed, 1);
    }

    #[test]
    fn test_records_without_id() {
        let store = store_with(vec![
            Record::without_id("b").with_subject("legacy"),
            Record::without_id("b").with_body("casino"),
        ]);
        let policy = FilterPolicy::new(FilterConfig {
            body: KeywordRule::new("casino"),
            ..Default::default()
        });

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let root_children = output.tree.children(output.tree.root());
        assert_eq!(root_children.len(), 1);
        assert_eq!(
            output.tree.record(root_children[0]).map(|r| r.subject.as_str()),
            Some("legacy")
        );
    }

    #[test]
    fn test_cycle_is_broken_at_root() {
        let store = store_with(vec![
            Record::new("b", "x", &["y"]),
            Record::new("b", "y", &["x"]),
        ]);
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;
        assert_eq!(tree.len(), 2);
        for node in [tree.find(&id("x")).unwrap(), tree.find(&id("y")).unwrap()] {
            assert!(tree.is_ancestor_or_self(tree.root(), node));
        }
    }

    #[test]
    fn test_flat_mode() {
        let store = store_with(vec![
            Record::new("b", "m1", &[]),
            Record::new("b", "m2", &["m1"]),
            Record::new("b", "m3", &["missing"]).with_body("casino"),
        ]);
        let policy = FilterPolicy::new(FilterConfig {
            body: KeywordRule::new("casino"),
            ..Default::default()
        });

        let output = build_tree(&store, &policy, false, &request()).unwrap();
        let tree = &output.tree;
        assert_eq!(tree.children(tree.root()).len(), 2);
        assert_eq!(parent_id(tree, "m2"), None);
        assert_eq!(output.stats.placeholders, 0);
        assert_eq!(output.read_clears, vec![id("m3")]);
    }

    #[test]
    fn test_duplicates_and_selection() {
        let store = MemoryRecordStore::new();
        store.insert(Record::new("b", "m1", &[]));
        store.insert(Record::new("b", "m2", &["m1"]));
        let policy = FilterPolicy::default();

        let output = build_tree(&store, &policy, true, &request().with_selection("m2")).unwrap();
        assert_eq!(output.selection, output.tree.find(&id("m2")));

        let output = build_tree(&store, &policy, true, &request().with_selection("zz")).unwrap();
        assert!(output.selection.is_none());
    }

    #[test]
    fn test_cancelled_build() {
        let store = store_with(vec![Record::new("b", "m1", &[])]);
        let policy = FilterPolicy::default();
        let token = CancellationToken::new();
        token.cancel();

        let result = ThreadBuilder::new(&store, &policy)
            .cancellation(token)
            .build(&request());
        assert!(matches!(result, Err(ThreadError::Cancelled)));
    }

    #[test]
    fn test_prune_reaches_fixpoint() {
        let store = store_with(vec![
            Record::new("b", "a1", &["p1", "p2"]).with_body("casino"),
            Record::new("b", "a2", &["p1", "p2", "a1"]).with_body("casino"),
            Record::new("b", "keep", &["p1"]),
        ]);
        let policy = FilterPolicy::new(FilterConfig {
            body: KeywordRule::new("casino"),
            ..Default::default()
        });

        let output = build_tree(&store, &policy, true, &request()).unwrap();
        let tree = &output.tree;
        for leaf in tree.leaves() {
            match tree.content(leaf) {
                Some(NodeContent::Record(record)) => assert!(!policy.is_blocked(record)),
                other => panic!("unexpected leaf {:?}", other),
            }
        }
        assert!(tree.find_placeholder(&id("p1")).is_some());
        assert!(tree.find(&id("p2")).is_none());
    }
}
