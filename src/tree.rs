//! Builds one rooted tree per merged conversation.
//!
//! Turns are laid out in recorded order. The first turn is the root; every
//! later turn hangs under its predecessor unless it names another parent, which
//! is how edits and regenerations show up as branches. Tool calls hang under
//! the step that issued them, ahead of that step's successor.
//!
//! Broken references never drop data: a turn whose parent is unknown is
//! attached to the root and flagged `orphaned`, and a parent chain that loops
//! is cut at the node where it closes, which is attached to the root and
//! flagged `cycle_broken`.
//!
//! Parent references may name a turn or a tool call; agent steps that follow a
//! tool result sometimes point at the call rather than the step.
//!
//! Trees are assembled from an index arena without recursion, since an
//! unbranched chat is a chain as deep as it is long.
use std::collections::{HashMap, HashSet};
use std::mem;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{ConversationNode, MergedConversation, Role};

const ROOT: usize = 0;

struct Draft {
    id: String,
    role: Role,
    content: String,
    timestamp: Option<DateTime<Utc>>,
    tool_name: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
    orphaned: bool,
    cycle_broken: bool,
}

/// Hands out node ids, suffixing repeats so every id in a tree is unique.
#[derive(Default)]
struct IdAllocator {
    used: HashSet<String>,
}

impl IdAllocator {
    fn claim(&mut self, wanted: String) -> String {
        if self.used.insert(wanted.clone()) {
            return wanted;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}#{}", wanted, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Build the conversation tree; `None` when the conversation has no turns.
pub fn build(conv: &MergedConversation) -> Option<ConversationNode> {
    let turns = conv.canonical_payload.turns();
    if turns.is_empty() {
        return None;
    }

    let mut ids = IdAllocator::default();
    let mut arena: Vec<Draft> = Vec::with_capacity(turns.len());
    let mut turn_nodes: Vec<usize> = Vec::with_capacity(turns.len());
    // Declared turn and tool-call ids resolve to the first node that used them.
    let mut by_declared_id: HashMap<&str, usize> = HashMap::new();

    for (i, turn) in turns.iter().enumerate() {
        let wanted = turn
            .id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", conv.conversation_id, i));
        let id = ids.claim(wanted);
        let idx = arena.len();
        if let Some(declared) = turn.id.as_deref() {
            by_declared_id.entry(declared).or_insert(idx);
        }
        arena.push(Draft {
            id: id.clone(),
            role: turn.role,
            content: turn.content.clone(),
            timestamp: turn.timestamp,
            tool_name: None,
            parent: None,
            children: Vec::new(),
            orphaned: false,
            cycle_broken: false,
        });
        turn_nodes.push(idx);

        for (k, call) in turn.tool_calls.iter().enumerate() {
            let call_id = ids.claim(
                call.id
                    .clone()
                    .unwrap_or_else(|| format!("{}/tool:{}", id, k)),
            );
            let call_idx = arena.len();
            if let Some(declared) = call.id.as_deref() {
                by_declared_id.entry(declared).or_insert(call_idx);
            }
            arena.push(Draft {
                id: call_id,
                role: Role::Tool,
                content: call.content.clone(),
                timestamp: call.timestamp.or(turn.timestamp),
                tool_name: Some(call.name.clone()),
                parent: Some(idx),
                children: Vec::new(),
                orphaned: false,
                cycle_broken: false,
            });
            arena[idx].children.push(call_idx);
        }
    }

    // Resolve declared parents.
    for (i, turn) in turns.iter().enumerate() {
        let node = turn_nodes[i];
        let resolved = match turn.parent_ref.as_deref() {
            Some(r) => by_declared_id.get(r).copied(),
            None if i > 0 => Some(turn_nodes[i - 1]),
            None => None,
        };

        if node == ROOT {
            // The root keeps its place; a dangling reference is still worth flagging.
            arena[ROOT].orphaned = turn.parent_ref.is_some() && resolved.is_none();
            continue;
        }

        match resolved {
            Some(p) if p == node => {
                arena[node].parent = Some(ROOT);
                arena[node].cycle_broken = true;
            }
            Some(p) => arena[node].parent = Some(p),
            None => {
                arena[node].parent = Some(ROOT);
                arena[node].orphaned = true;
            }
        }
    }

    break_cycles(&mut arena, &turn_nodes);

    for &node in turn_nodes.iter().skip(1) {
        if let Some(p) = arena[node].parent {
            arena[p].children.push(node);
        }
    }

    let flagged = arena.iter().filter(|d| d.orphaned || d.cycle_broken).count();
    if flagged > 0 {
        debug!(conversation = %conv.conversation_id, flagged, "re-attached nodes to root");
    }

    materialize(&mut arena)
}

/// Walk each turn's parent chain; where a chain revisits a node on the current
/// path, re-attach that node to the root.
fn break_cycles(arena: &mut [Draft], turn_nodes: &[usize]) {
    let mut settled = vec![false; arena.len()];
    settled[ROOT] = true;

    for &start in turn_nodes {
        let mut path: Vec<usize> = Vec::new();
        let mut on_path: HashSet<usize> = HashSet::new();
        let mut cur = start;
        loop {
            if settled[cur] {
                break;
            }
            if !on_path.insert(cur) {
                arena[cur].parent = Some(ROOT);
                arena[cur].cycle_broken = true;
                break;
            }
            path.push(cur);
            match arena[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        for node in path {
            settled[node] = true;
        }
    }
}

/// Turn the arena into owned nodes, children before parents.
fn materialize(arena: &mut [Draft]) -> Option<ConversationNode> {
    let mut order = Vec::with_capacity(arena.len());
    let mut stack = vec![ROOT];
    while let Some(idx) = stack.pop() {
        order.push(idx);
        stack.extend(arena[idx].children.iter().rev());
    }

    let mut built: Vec<Option<ConversationNode>> = (0..arena.len()).map(|_| None).collect();
    // Reverse pre-order: a parent's id is still in the arena when its children need it.
    for &idx in order.iter().rev() {
        let children = mem::take(&mut arena[idx].children)
            .into_iter()
            .filter_map(|child| built[child].take())
            .collect();
        let parent_id = arena[idx].parent.map(|p| arena[p].id.clone());
        let draft = &mut arena[idx];
        built[idx] = Some(ConversationNode {
            id: mem::take(&mut draft.id),
            role: draft.role,
            content: mem::take(&mut draft.content),
            timestamp: draft.timestamp,
            tool_name: draft.tool_name.take(),
            children,
            orphaned: draft.orphaned,
            cycle_broken: draft.cycle_broken,
            parent_id,
        });
    }
    built[ROOT].take()
}
