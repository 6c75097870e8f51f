//! The versioned revision tree
//!
//! [`RevisionTree`] records, for every path component ever backed up, an
//! ordered history of [`Revision`]s. It is an arena: nodes live in a `Vec`
//! and refer to their parent and children by [`NodeId`], so the parent
//! back-reference used to rebuild paths never forms an ownership cycle.
//!
//! ## Structure
//!
//! ```text
//! (root)                      Directory{+home}
//! └── home                    Directory{+alice}
//!     └── alice               Directory{+notes.txt,+photo.jpg} Directory{-photo.jpg}
//!         ├── notes.txt       File(g1) File(g2)
//!         └── photo.jpg       File(g3)
//! ```
//!
//! History is append-only and time-monotonic: a revision may only be
//! appended with a date strictly after the node's last one (a directory
//! delta dated exactly at the last directory revision is amended in place
//! instead). Every rejected append leaves the tree untouched.
//!
//! The tree also keeps a reference count per content guid so deduplication
//! can find an existing identifier and space reclamation can tell whether a
//! removed revision was the last one using its stored bytes.

use crate::collections::{HashMap, HashMapExt};
use crate::error::{Result, VaultError};
use crate::revision::{
    governing_index, members_at, DirectoryRevision, FileRevision, Revision, RevisionIdentifier,
};
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use tracing::{debug, trace};

/// Stable identity of a node within one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// One path component of the namespace and its history
#[derive(Debug)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    /// Sorted by child name, unique
    children: Vec<NodeId>,
    revisions: Vec<Revision>,
    /// Aggregate stored size of this subtree, `None` when stale
    cached_size: Cell<Option<u64>>,
}

impl Node {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            revisions: Vec::new(),
            cached_size: Cell::new(None),
        }
    }

    /// Path component name (empty for the root)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning directory node
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child nodes, ordered by name
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Full history, oldest first
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// Most recent revision
    pub fn last_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Most recent file revision, skipping directory revisions
    pub fn last_file_revision(&self) -> Option<&FileRevision> {
        self.revisions.iter().rev().find_map(Revision::as_file)
    }

    /// Number of file revisions in the history
    pub fn file_revision_count(&self) -> usize {
        self.revisions.iter().filter(|r| !r.is_directory()).count()
    }

    /// Stored bytes of this node's own file revisions (not its children)
    pub fn own_backed_up_size(&self) -> u64 {
        self.revisions
            .iter()
            .filter_map(Revision::as_file)
            .map(|f| f.stored_size)
            .sum()
    }
}

#[derive(Debug, Clone)]
struct IdentifierUse {
    identifier: RevisionIdentifier,
    stored_size: u64,
    references: usize,
}

/// A file revision detached by [`RevisionTree::remove_file_revision`]
#[derive(Debug, Clone)]
pub struct RemovedRevision {
    /// Path of the node the revision belonged to
    pub path: PathBuf,
    /// The detached revision
    pub revision: FileRevision,
    /// True when no remaining revision references the same guid
    pub last_reference: bool,
}

/// Arena-backed tree of nodes and their revision histories
#[derive(Debug)]
pub struct RevisionTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: NodeId,
    identifiers: HashMap<String, IdentifierUse>,
}

impl Default for RevisionTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a path into the names used as node keys
///
/// Root and `.` components are dropped; a Windows prefix such as `C:` is kept
/// as the first name.
pub fn path_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Prefix(prefix) => Some(prefix.as_os_str().to_string_lossy().into_owned()),
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            Component::RootDir | Component::CurDir => None,
            Component::ParentDir => Some("..".to_string()),
        })
        .collect()
}

impl RevisionTree {
    /// Create an empty tree holding only the root node
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::new(String::new(), None))],
            free: Vec::new(),
            root: NodeId(0),
            identifiers: HashMap::new(),
        }
    }

    /// The root node's id
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Look up a live node
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Live node reached through the tree's own links
    ///
    /// Public entry points taking a caller's [`NodeId`] check it with
    /// [`RevisionTree::node`] before reaching here.
    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("node {id:?} was freed while still referenced"))
    }

    fn get(&self, id: NodeId) -> &Node {
        self.nodes[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("node {id:?} was freed while still referenced"))
    }

    /// Number of live nodes, including the root
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Ids of all live nodes
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_some())
            .map(|(i, _)| NodeId(i))
    }

    /// Child of `parent` with the given name
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let children = &self.node(parent)?.children;
        children
            .binary_search_by(|c| self.get(*c).name.as_str().cmp(name))
            .ok()
            .map(|i| children[i])
    }

    fn child_or_insert(&mut self, parent: NodeId, name: &str) -> NodeId {
        let position = self
            .get(parent)
            .children
            .binary_search_by(|c| self.get(*c).name.as_str().cmp(name));
        match position {
            Ok(i) => self.get(parent).children[i],
            Err(i) => {
                let id = self.allocate(Node::new(name.to_string(), Some(parent)));
                self.node_mut(parent).children.insert(i, id);
                trace!("Created node {:?} under {:?}", name, parent);
                id
            }
        }
    }

    fn allocate(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Find the node for a path
    pub fn find_node(&self, path: &Path) -> Option<NodeId> {
        path_components(path)
            .iter()
            .try_fold(self.root, |id, name| self.child(id, name))
    }

    /// Rebuild the absolute path of a node from its parent links
    ///
    /// `None` if `id` no longer names a live node.
    pub fn node_path(&self, id: NodeId) -> Option<PathBuf> {
        self.node(id)?;
        Some(self.path_of(id))
    }

    fn path_of(&self, id: NodeId) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.get(current);
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        names.reverse();

        let mut path = PathBuf::from(MAIN_SEPARATOR.to_string());
        for (i, name) in names.iter().enumerate() {
            if cfg!(windows) && i == 0 && name.ends_with(':') {
                path = PathBuf::from(format!("{name}{MAIN_SEPARATOR}"));
            } else {
                path.push(name);
            }
        }
        path
    }

    /// Revision governing `as_of` (latest with date <= as_of; `None` = latest)
    pub fn find_revision(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Option<&Revision> {
        let node = self.node(self.find_node(path)?)?;
        governing_index(&node.revisions, as_of).map(|i| &node.revisions[i])
    }

    /// Full history of a path, oldest first (empty if unknown)
    pub fn history(&self, path: &Path) -> &[Revision] {
        self.find_node(path)
            .and_then(|id| self.node(id))
            .map(|n| n.revisions.as_slice())
            .unwrap_or(&[])
    }

    /// Members of a directory as of a date
    ///
    /// `None` if the path is unknown or was not a directory at that date.
    pub fn children_as_of(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Option<BTreeSet<String>> {
        let node = self.node(self.find_node(path)?)?;
        let index = governing_index(&node.revisions, as_of)?;
        members_at(&node.revisions, index)
    }

    fn ordering_violation(&self, id: NodeId, last: DateTime<Utc>, attempted: DateTime<Utc>) -> VaultError {
        VaultError::HistoryOrderingViolation {
            path: self.path_of(id),
            last,
            attempted,
        }
    }

    /// Check that `id` can carry a directory revision covering `date`
    fn check_directory_slot(&self, id: NodeId, date: DateTime<Utc>) -> Result<()> {
        match self.get(id).last_revision() {
            Some(last) if last.date() > date => Err(self.ordering_violation(id, last.date(), date)),
            Some(last) if last.date() == date && !last.is_directory() => {
                Err(self.ordering_violation(id, last.date(), date))
            }
            _ => Ok(()),
        }
    }

    /// Make `name` a member of directory `id` as of `date`
    fn ensure_member(&mut self, id: NodeId, name: &str, date: DateTime<Utc>) {
        let node = self.get(id);
        let current = node
            .revisions
            .len()
            .checked_sub(1)
            .and_then(|i| members_at(&node.revisions, i));
        if current.as_ref().is_some_and(|m| m.contains(name)) {
            return;
        }
        let node = self.node_mut(id);
        match node.revisions.last_mut() {
            Some(Revision::Directory(dir)) if dir.date == date => dir.add_member(name),
            _ => {
                let mut dir = DirectoryRevision::new(date);
                dir.add_member(name);
                node.revisions.push(Revision::Directory(dir));
            }
        }
    }

    /// Record that `path` was a file with the given content at `revision.date`
    ///
    /// Intermediate nodes are created as needed and every ancestor gets a
    /// directory revision covering the date that lists the next component.
    /// Fails with [`VaultError::HistoryOrderingViolation`] (leaving the tree
    /// unchanged) if the date is not after the target's last revision, or if
    /// an ancestor already has history after the date.
    pub fn record_file_revision(&mut self, path: &Path, revision: FileRevision) -> Result<NodeId> {
        let names = path_components(path);
        if names.is_empty() {
            return Err(VaultError::internal("cannot record a file revision for the root"));
        }
        let date = revision.date;

        // Validate the whole chain before mutating anything
        let mut cursor = Some(self.root);
        for name in &names {
            let Some(id) = cursor else { break };
            self.check_directory_slot(id, date)?;
            cursor = self.child(id, name);
        }
        if let Some(target) = cursor {
            if let Some(last) = self.get(target).last_revision() {
                if last.date() >= date {
                    return Err(self.ordering_violation(target, last.date(), date));
                }
            }
        }

        let mut current = self.root;
        for name in &names {
            let child = self.child_or_insert(current, name);
            self.ensure_member(current, name, date);
            current = child;
        }

        self.retain_identifier(&revision.identifier, revision.stored_size);
        self.node_mut(current).revisions.push(Revision::File(revision));
        self.invalidate_sizes(current);
        trace!("Recorded file revision for {:?} at {}", path, date);
        Ok(current)
    }

    /// Remove from a directory's current members any name not in `present`
    ///
    /// Used after scanning a directory to record deletions. The change is a
    /// new delta revision, or an amendment of a delta already dated `date`.
    /// Returns the names that were removed.
    pub fn update_directory_membership<S: AsRef<str>>(
        &mut self,
        path: &Path,
        date: DateTime<Utc>,
        present: &[S],
    ) -> Result<Vec<String>> {
        let Some(id) = self.find_node(path) else {
            return Ok(Vec::new());
        };
        let node = self.get(id);
        let Some(last_index) = node.revisions.len().checked_sub(1) else {
            return Ok(Vec::new());
        };
        let Some(members) = members_at(&node.revisions, last_index) else {
            return Ok(Vec::new());
        };
        let present: BTreeSet<&str> = present.iter().map(AsRef::as_ref).collect();
        let removed: Vec<String> = members
            .into_iter()
            .filter(|name| !present.contains(name.as_str()))
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        let last_date = node.revisions[last_index].date();
        if last_date > date {
            return Err(self.ordering_violation(id, last_date, date));
        }
        let node = self.node_mut(id);
        if last_date < date {
            node.revisions.push(Revision::Directory(DirectoryRevision::new(date)));
        }
        if let Some(Revision::Directory(dir)) = node.revisions.last_mut() {
            for name in &removed {
                dir.remove_member(name);
            }
        }
        debug!("Recorded {} deletion(s) in {:?}", removed.len(), path);
        Ok(removed)
    }

    /// Detach the file revision of node `id` dated `date`
    ///
    /// If the node is left without revisions and children it is garbage
    /// collected, and so on up the ancestor chain.
    pub fn remove_file_revision(&mut self, id: NodeId, date: DateTime<Utc>) -> Result<RemovedRevision> {
        let path = self
            .node_path(id)
            .ok_or_else(|| VaultError::internal(format!("unknown node {id:?}")))?;
        let index = self
            .get(id)
            .revisions
            .iter()
            .position(|r| !r.is_directory() && r.date() == date)
            .ok_or_else(|| VaultError::NotFound(path.clone()))?;

        // Keep the directory run after the removed file revision from
        // merging with the run before it.
        let revisions = &self.get(id).revisions;
        let reset = if index > 0 && revisions.get(index + 1).is_some_and(Revision::is_directory) {
            members_at(revisions, index - 1)
        } else {
            None
        };

        let node = self.node_mut(id);
        let Revision::File(revision) = node.revisions.remove(index) else {
            return Err(VaultError::internal("revision kind changed during removal"));
        };
        if let (Some(previous), Some(Revision::Directory(next))) = (reset, node.revisions.get_mut(index)) {
            for name in previous {
                if !next.added.contains(&name) {
                    next.removed.insert(name);
                }
            }
        }

        let last_reference = self.release_identifier(&revision.identifier.guid);
        self.invalidate_sizes(id);
        self.collect_garbage(id);
        debug!("Removed revision of {:?} dated {}", path, date);
        Ok(RemovedRevision {
            path,
            revision,
            last_reference,
        })
    }

    fn collect_garbage(&mut self, mut id: NodeId) {
        while id != self.root {
            let node = self.get(id);
            if !node.revisions.is_empty() || !node.children.is_empty() {
                break;
            }
            let Some(parent) = node.parent else { break };
            self.node_mut(parent).children.retain(|c| *c != id);
            self.nodes[id.0] = None;
            self.free.push(id);
            trace!("Collected empty node {:?}", id);
            id = parent;
        }
    }

    fn invalidate_sizes(&self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.get(current);
            node.cached_size.set(None);
            cursor = node.parent;
        }
    }

    /// Total stored bytes of a node and all its descendants (cached)
    ///
    /// `None` if `id` no longer names a live node.
    pub fn backed_up_size(&self, id: NodeId) -> Option<u64> {
        self.node(id)?;
        Some(self.size_of(id))
    }

    fn size_of(&self, id: NodeId) -> u64 {
        let node = self.get(id);
        if let Some(size) = node.cached_size.get() {
            return size;
        }
        let size = node.own_backed_up_size()
            + node.children.iter().map(|c| self.size_of(*c)).sum::<u64>();
        node.cached_size.set(Some(size));
        size
    }

    /// The `limit` nodes with the largest own stored size, largest first
    ///
    /// Ties are broken by path so the order is deterministic. Nodes without
    /// stored bytes are not reported.
    pub fn find_largest_nodes(&self, limit: usize) -> Vec<(NodeId, u64)> {
        let mut sized: Vec<(u64, PathBuf, NodeId)> = self
            .node_ids()
            .filter_map(|id| {
                let size = self.get(id).own_backed_up_size();
                (size > 0).then(|| (size, self.path_of(id), id))
            })
            .collect();
        sized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        sized.into_iter().take(limit).map(|(size, _, id)| (id, size)).collect()
    }

    /// Every file revision visible under `path` as of a date
    ///
    /// A file yields its governing revision; a directory expands to the
    /// governing revisions of all members visible at that date, recursively.
    pub fn file_revisions_as_of(&self, path: &Path, as_of: Option<DateTime<Utc>>) -> Vec<(PathBuf, FileRevision)> {
        let mut found = Vec::new();
        if let Some(id) = self.find_node(path) {
            self.collect_file_revisions(id, path.to_path_buf(), as_of, &mut found);
        }
        found
    }

    fn collect_file_revisions(
        &self,
        id: NodeId,
        path: PathBuf,
        as_of: Option<DateTime<Utc>>,
        found: &mut Vec<(PathBuf, FileRevision)>,
    ) {
        let node = self.get(id);
        let Some(index) = governing_index(&node.revisions, as_of) else {
            return;
        };
        match &node.revisions[index] {
            Revision::File(file) => found.push((path, file.clone())),
            Revision::Directory(_) => {
                let members = members_at(&node.revisions, index).unwrap_or_default();
                for name in members {
                    if let Some(child) = self.child(id, &name) {
                        self.collect_file_revisions(child, path.join(&name), as_of, found);
                    }
                }
            }
        }
    }

    fn retain_identifier(&mut self, identifier: &RevisionIdentifier, stored_size: u64) {
        self.identifiers
            .entry(identifier.guid.clone())
            .and_modify(|u| u.references += 1)
            .or_insert_with(|| IdentifierUse {
                identifier: identifier.clone(),
                stored_size,
                references: 1,
            });
    }

    /// Returns true if this released the last reference
    fn release_identifier(&mut self, guid: &str) -> bool {
        match self.identifiers.get_mut(guid) {
            Some(usage) if usage.references > 1 => {
                usage.references -= 1;
                false
            }
            Some(_) => {
                self.identifiers.remove(guid);
                true
            }
            None => true,
        }
    }

    /// Existing identifier and stored size for a content guid
    pub fn find_identifier(&self, guid: &str) -> Option<(RevisionIdentifier, u64)> {
        self.identifiers
            .get(guid)
            .map(|u| (u.identifier.clone(), u.stored_size))
    }

    /// Whether any revision still references a guid
    pub fn identifier_in_use(&self, guid: &str) -> bool {
        self.identifiers.contains_key(guid)
    }

    /// Average stored/original ratio per lowercase file extension
    pub fn extension_ratios(&self) -> HashMap<String, f64> {
        let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
        for id in self.node_ids() {
            let node = self.get(id);
            let Some(extension) = Path::new(&node.name).extension() else {
                continue;
            };
            let entry = totals
                .entry(extension.to_string_lossy().to_lowercase())
                .or_insert((0, 0));
            for file in node.revisions.iter().filter_map(Revision::as_file) {
                entry.0 += file.stored_size;
                entry.1 += file.original_size;
            }
        }
        totals
            .into_iter()
            .filter(|(_, (_, original))| *original > 0)
            .map(|(ext, (stored, original))| (ext, stored as f64 / original as f64))
            .collect()
    }

    /// Attach a node read from the persisted index
    ///
    /// Children must be attached in the order they were saved (sorted by
    /// name) and revisions must already be in date order.
    pub(crate) fn attach_loaded(
        &mut self,
        parent: Option<NodeId>,
        name: String,
        revisions: Vec<Revision>,
    ) -> Result<NodeId> {
        if revisions.windows(2).any(|w| w[0].date() >= w[1].date()) {
            return Err(VaultError::CorruptIndex(format!(
                "revisions of {name:?} are not in date order"
            )));
        }
        let id = match parent {
            None => self.root,
            Some(parent) => {
                if let Some(&last) = self.get(parent).children.last() {
                    if self.get(last).name >= name {
                        return Err(VaultError::CorruptIndex(format!(
                            "children out of order at {name:?}"
                        )));
                    }
                }
                let id = self.allocate(Node::new(name, Some(parent)));
                self.node_mut(parent).children.push(id);
                id
            }
        };
        for file in revisions.iter().filter_map(Revision::as_file) {
            self.retain_identifier(&file.identifier, file.stored_size);
        }
        self.node_mut(id).revisions = revisions;
        Ok(id)
    }
}
