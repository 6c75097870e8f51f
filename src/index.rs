//! Binary index format for the revision tree
//!
//! The index is the authoritative persisted state of a [`RevisionTree`]. It is
//! written by a full walk of the tree and must round-trip exactly: saving a
//! freshly loaded index produces the same bytes.
//!
//! ## Layout
//!
//! ```text
//! +--------+---------+------------------------------------------+
//! | "VKIX" | version | bincode(fixed-int) recursive node record |
//! | 4 B    | u16 LE  |                                          |
//! +--------+---------+------------------------------------------+
//!
//! node     := name, child-count, node*, revision-count, revision*
//! revision := tag (0 = file, 1 = directory), payload
//! ```
//!
//! Fixed-int encoding makes every length prefix 8 bytes wide, so the layout
//! does not depend on the values being encoded.

use crate::error::{Result, VaultError};
use crate::revision::{DirectoryRevision, FileRevision, Revision, RevisionIdentifier};
use crate::tree::{NodeId, RevisionTree};
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Magic bytes at the start of every index file
pub const INDEX_MAGIC: &[u8; 4] = b"VKIX";

/// Current index format version
pub const INDEX_VERSION: u16 = 1;

const HEADER_LEN: usize = INDEX_MAGIC.len() + 2;

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    name: String,
    children: Vec<NodeRecord>,
    revisions: Vec<RevisionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Timestamp {
    secs: i64,
    nanos: u32,
}

#[derive(Debug, Serialize, Deserialize)]
enum RevisionRecord {
    File {
        date: Timestamp,
        guid: String,
        handler_name: String,
        original_size: u64,
        stored_size: u64,
    },
    Directory {
        date: Timestamp,
        added: Vec<String>,
        removed: Vec<String>,
    },
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(date: DateTime<Utc>) -> Self {
        Self {
            secs: date.timestamp(),
            nanos: date.timestamp_subsec_nanos(),
        }
    }
}

impl TryFrom<Timestamp> for DateTime<Utc> {
    type Error = VaultError;

    fn try_from(ts: Timestamp) -> Result<Self> {
        DateTime::from_timestamp(ts.secs, ts.nanos)
            .ok_or_else(|| VaultError::CorruptIndex(format!("timestamp {}.{} out of range", ts.secs, ts.nanos)))
    }
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

fn to_record(revision: &Revision) -> RevisionRecord {
    match revision {
        Revision::File(file) => RevisionRecord::File {
            date: file.date.into(),
            guid: file.identifier.guid.clone(),
            handler_name: file.identifier.handler_name.clone(),
            original_size: file.original_size,
            stored_size: file.stored_size,
        },
        Revision::Directory(dir) => RevisionRecord::Directory {
            date: dir.date.into(),
            added: dir.added.iter().cloned().collect(),
            removed: dir.removed.iter().cloned().collect(),
        },
    }
}

fn from_record(record: RevisionRecord) -> Result<Revision> {
    Ok(match record {
        RevisionRecord::File {
            date,
            guid,
            handler_name,
            original_size,
            stored_size,
        } => Revision::File(FileRevision {
            date: date.try_into()?,
            identifier: RevisionIdentifier::with_handler(guid, handler_name),
            original_size,
            stored_size,
        }),
        RevisionRecord::Directory { date, added, removed } => Revision::Directory(DirectoryRevision {
            date: date.try_into()?,
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
        }),
    })
}

fn node_record(tree: &RevisionTree, id: NodeId) -> Result<NodeRecord> {
    let node = tree
        .node(id)
        .ok_or_else(|| VaultError::internal(format!("dangling node {id:?}")))?;
    Ok(NodeRecord {
        name: node.name().to_string(),
        children: node
            .children()
            .iter()
            .map(|child| node_record(tree, *child))
            .collect::<Result<_>>()?,
        revisions: node.revisions().iter().map(to_record).collect(),
    })
}

fn attach_record(tree: &mut RevisionTree, parent: Option<NodeId>, record: NodeRecord) -> Result<()> {
    let revisions = record
        .revisions
        .into_iter()
        .map(from_record)
        .collect::<Result<Vec<_>>>()?;
    let id = tree.attach_loaded(parent, record.name, revisions)?;
    for child in record.children {
        attach_record(tree, Some(id), child)?;
    }
    Ok(())
}

/// Serialize a tree into index bytes
pub fn encode_tree(tree: &RevisionTree) -> Result<Vec<u8>> {
    let root = node_record(tree, tree.root())?;
    let body = bincode::serde::encode_to_vec(&root, bincode_config())?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Rebuild a tree from index bytes
///
/// # Errors
///
/// - [`VaultError::CorruptIndex`] if the header is wrong, the version is
///   unsupported, trailing bytes follow the body, or histories are out of order
/// - [`VaultError::Bincode`] if the body cannot be decoded
pub fn decode_tree(bytes: &[u8]) -> Result<RevisionTree> {
    if bytes.len() < HEADER_LEN || &bytes[..INDEX_MAGIC.len()] != INDEX_MAGIC {
        return Err(VaultError::CorruptIndex("missing index header".to_string()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != INDEX_VERSION {
        return Err(VaultError::CorruptIndex(format!(
            "unsupported index version {version}"
        )));
    }

    let (root, read): (NodeRecord, usize) =
        bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode_config())?;
    if HEADER_LEN + read != bytes.len() {
        return Err(VaultError::CorruptIndex(format!(
            "{} trailing bytes after index body",
            bytes.len() - HEADER_LEN - read
        )));
    }

    let mut tree = RevisionTree::new();
    attach_record(&mut tree, None, root)?;
    Ok(tree)
}

/// Write a tree to an index file atomically
pub fn write_index(path: &Path, tree: &RevisionTree) -> Result<u64> {
    let bytes = encode_tree(tree)?;
    atomic_write(path, &bytes)?;
    debug!("Wrote index {:?} ({} bytes, {} nodes)", path, bytes.len(), tree.node_count());
    Ok(bytes.len() as u64)
}

/// Read a tree from an index file
pub fn read_index(path: &Path) -> Result<RevisionTree> {
    let bytes = fs::read(path)?;
    let tree = decode_tree(&bytes)?;
    info!("Loaded index {:?} ({} nodes)", path, tree.node_count());
    Ok(tree)
}
