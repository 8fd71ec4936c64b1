//! Normalized data model shared by every stage of the extraction pipeline.
//!
//! Records move through the stages in one direction:
//!
//! ```text
//! RawEntry ──decode──▶ DecodedRecord ──merge──▶ MergedConversation ──build──▶ ConversationNode
//! ```
//!
//! Only [`MergedConversation`] outlives its stage; it is kept in the extraction
//! result so a conversation can be re-exported without rescanning the stores.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// One storage backend instance.
///
/// Ordering is the merge order: the global store sorts before every workspace,
/// and workspaces sort by their storage directory name, which is also the order
/// in which they are discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeId {
    Global,
    /// Keyed by the workspace storage directory name (an opaque hash).
    Workspace(String),
}

impl ScopeId {
    pub fn is_workspace(&self) -> bool {
        matches!(self, ScopeId::Workspace(_))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Global => write!(f, "global"),
            ScopeId::Workspace(id) => write!(f, "workspace:{}", id),
        }
    }
}

// ---------------------------------------------------------------------------
// Schema kinds and roles
// ---------------------------------------------------------------------------

/// Which of the two known record families a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// The sidebar chat panel (`tabs` of `bubbles`).
    Chat,
    /// The composer/agent panel (steps that may carry tool calls).
    Composer,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Chat => write!(f, "chat"),
            SchemaKind::Composer => write!(f, "composer"),
        }
    }
}

/// Author of a conversation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

// ---------------------------------------------------------------------------
// Normalized payload
// ---------------------------------------------------------------------------

/// A tool invocation recorded inside a composer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    /// Tool result if recorded, otherwise the raw arguments.
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One message (chat) or step (composer) after alias normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Explicit branch marker: the id of the turn this one was edited from or
    /// regenerated under. `None` means "follows its predecessor".
    pub parent_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overflow: BTreeMap<String, Value>,
}

/// The normalized field map of one conversation record.
///
/// Every canonical field is optional because no historical version of either
/// schema is guaranteed to carry it. Fields that no alias claimed are kept
/// verbatim in `overflow`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub title: Option<String>,
    /// Unsent composer input, also used as a title fallback.
    pub draft_text: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    /// Messages (chat) or steps (composer), in recorded order.
    pub turns: Option<Vec<Turn>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overflow: BTreeMap<String, Value>,
}

impl Payload {
    /// Number of canonical fields that carry a value.
    pub fn completeness(&self) -> u32 {
        [
            self.title.is_some(),
            self.draft_text.is_some(),
            self.created_at.is_some(),
            self.updated_at.is_some(),
            self.status.is_some(),
            self.turns.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }

    pub fn turns(&self) -> &[Turn] {
        self.turns.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Pipeline records
// ---------------------------------------------------------------------------

/// A single conversation record decoded from one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub conversation_id: String,
    pub schema_kind: SchemaKind,
    pub scope_id: ScopeId,
    pub payload: Payload,
    pub completeness_score: u32,
    /// Position in the overall scan; larger means scanned later.
    pub sequence: u64,
}

/// All records sharing one conversation id, reconciled into a single payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedConversation {
    pub conversation_id: String,
    pub schema_kind: SchemaKind,
    pub canonical_payload: Payload,
    pub source_scopes: BTreeSet<ScopeId>,
}

// ---------------------------------------------------------------------------
// Conversation tree
// ---------------------------------------------------------------------------

fn is_false(b: &bool) -> bool {
    !*b
}

/// A node of a conversation tree.
///
/// The parent owns its `children`. `parent_id` is only a lookup key back to the
/// parent and is not serialized; [`crate::exporter::read_export`] restores it.
///
/// A chat without branches is a chain as deep as it is long, so `Clone`,
/// `PartialEq` and `Drop` walk the tree with an explicit stack.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationNode {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Set on tool nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub children: Vec<ConversationNode>,
    /// Declared a parent that does not exist; attached to the root instead.
    #[serde(default, skip_serializing_if = "is_false")]
    pub orphaned: bool,
    /// Detached from a parent cycle and attached to the root.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cycle_broken: bool,
    #[serde(skip)]
    pub parent_id: Option<String>,
}

impl ConversationNode {
    /// Depth-first, pre-order traversal yielding each node with its depth.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: vec![(0, self)],
        }
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    /// Copy of this node's own fields with the given children.
    fn with_children(&self, children: Vec<ConversationNode>) -> ConversationNode {
        ConversationNode {
            id: self.id.clone(),
            role: self.role,
            content: self.content.clone(),
            timestamp: self.timestamp,
            tool_name: self.tool_name.clone(),
            children,
            orphaned: self.orphaned,
            cycle_broken: self.cycle_broken,
            parent_id: self.parent_id.clone(),
        }
    }

    fn same_fields(&self, other: &ConversationNode) -> bool {
        self.id == other.id
            && self.role == other.role
            && self.content == other.content
            && self.timestamp == other.timestamp
            && self.tool_name == other.tool_name
            && self.children.len() == other.children.len()
            && self.orphaned == other.orphaned
            && self.cycle_broken == other.cycle_broken
            && self.parent_id == other.parent_id
    }

    /// Re-derive `parent_id` from the ownership structure.
    pub fn relink_parents(&mut self) {
        self.parent_id = None;
        let mut stack: Vec<&mut ConversationNode> = vec![self];
        while let Some(node) = stack.pop() {
            let id = node.id.clone();
            for child in node.children.iter_mut() {
                child.parent_id = Some(id.clone());
                stack.push(child);
            }
        }
    }
}

impl Clone for ConversationNode {
    fn clone(&self) -> Self {
        // Rebuild in reverse pre-order: every subtree is finished before its parent.
        let preorder: Vec<&ConversationNode> = self.iter().map(|(_, n)| n).collect();
        let mut done: Vec<ConversationNode> = Vec::with_capacity(preorder.len());
        for node in preorder.iter().skip(1).rev() {
            let mut children = done.split_off(done.len() - node.children.len());
            children.reverse();
            done.push(node.with_children(children));
        }
        // What is left are the root's children, last one first.
        done.reverse();
        self.with_children(done)
    }
}

impl PartialEq for ConversationNode {
    fn eq(&self, other: &Self) -> bool {
        // Pre-order plus depth and child counts pins down the shape.
        let mut left = self.iter();
        let mut right = other.iter();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some((da, a)), Some((db, b))) if da == db && a.same_fields(b) => {}
                _ => return false,
            }
        }
    }
}

impl Drop for ConversationNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

pub struct Iter<'a> {
    stack: Vec<(usize, &'a ConversationNode)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (usize, &'a ConversationNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().map(|c| (depth + 1, c)));
        Some((depth, node))
    }
}

/// A built conversation as handed to the export writers and viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTree {
    pub id: String,
    pub schema_kind: SchemaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub root: ConversationNode,
}
