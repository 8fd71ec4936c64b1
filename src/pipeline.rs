//! Runs scan → decode → merge → build over a set of scopes.
//!
//! Individual failures never abort a run: an unavailable store only removes
//! its own scope, and a row that does not decode is skipped and counted. The
//! run fails only when there is nothing to scan at all.
use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::decoder::decode_entry;
use crate::merger::merge;
use crate::model::{ConversationTree, DecodedRecord, MergedConversation, ScopeId};
use crate::scanner::{KeyPatterns, OpenMode, ScanError, Scope, scan};
use crate::tree::build;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no storage scopes found")]
    NoScopes,
    #[error("all {count} storage scopes are unavailable")]
    AllScopesUnavailable { count: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub mode: OpenMode,
    pub patterns: KeyPatterns,
    /// Stop scanning once this instant has passed and return what was read.
    pub deadline: Option<Instant>,
}

/// A row that was matched but produced no record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipReason {
    pub scope: ScopeId,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub scopes_scanned: usize,
    pub scopes_empty: usize,
    pub scopes_failed: usize,
    pub records_decoded: usize,
    pub records_skipped: usize,
    pub conversations_produced: usize,
    /// Merged conversations without a single turn (composer drafts).
    pub conversations_empty: usize,
    pub nodes_orphaned: usize,
    pub nodes_cycle_broken: usize,
    pub truncated: bool,
    pub skip_reasons: Vec<SkipReason>,
}

impl RunSummary {
    fn skip(&mut self, scope: &ScopeId, key: &str, reason: String) {
        self.records_skipped += 1;
        self.skip_reasons.push(SkipReason {
            scope: scope.clone(),
            key: key.to_string(),
            reason,
        });
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    /// Built trees, ordered by conversation id.
    pub conversations: Vec<ConversationTree>,
    pub merged: BTreeMap<String, MergedConversation>,
    /// Workspace folder of each scanned scope that has one.
    pub folders: BTreeMap<ScopeId, String>,
    pub summary: RunSummary,
}

impl Extraction {
    /// Folders of the workspaces a conversation was found in.
    pub fn folders_of(&self, conversation_id: &str) -> Vec<&str> {
        self.merged
            .get(conversation_id)
            .map(|conv| {
                conv.source_scopes
                    .iter()
                    .filter_map(|scope| self.folders.get(scope).map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| now() >= d)
}

#[cfg(not(test))]
fn now() -> Instant {
    Instant::now()
}

#[cfg(test)]
fn now() -> Instant {
    tests::fake_now()
}

pub fn extract(scopes: &[Scope], options: &ExtractOptions) -> Result<Extraction, ExtractError> {
    if scopes.is_empty() {
        return Err(ExtractError::NoScopes);
    }

    // Global first; workspaces keep the order they were given in.
    let mut ordered: Vec<&Scope> = scopes.iter().collect();
    ordered.sort_by_key(|scope| scope.id.is_workspace());

    let mut summary = RunSummary::default();
    let mut folders = BTreeMap::new();
    let mut records: Vec<DecodedRecord> = Vec::new();
    let mut sequence = 0u64;

    'scopes: for scope in ordered {
        if expired(options.deadline) {
            summary.truncated = true;
            break;
        }
        let span = info_span!("scope", scope = %scope.id);
        let _enter = span.enter();

        let rows = match scan(scope, options.mode, &options.patterns) {
            Ok(rows) => rows,
            Err(ScanError::ScopeEmpty { .. }) => {
                info!("no conversation keys");
                summary.scopes_scanned += 1;
                summary.scopes_empty += 1;
                continue;
            }
            Err(e) => {
                warn!(path = %scope.db_path.display(), "{}", e);
                summary.scopes_failed += 1;
                continue;
            }
        };
        summary.scopes_scanned += 1;
        if let Some(folder) = &scope.folder {
            folders.insert(scope.id.clone(), folder.clone());
        }

        let before = records.len();
        for row in rows {
            if expired(options.deadline) {
                summary.truncated = true;
                break 'scopes;
            }
            let entry = match row {
                Ok(entry) => entry,
                Err(ScanError::ReadFailed { key, reason, .. }) => {
                    debug!(key = %key, reason = %reason, "skipping unreadable row");
                    summary.skip(&scope.id, &key, reason);
                    continue;
                }
                Err(e) => {
                    summary.skip(&scope.id, "", e.to_string());
                    continue;
                }
            };
            for result in decode_entry(&entry) {
                match result {
                    Ok(mut record) => {
                        record.sequence = sequence;
                        sequence += 1;
                        records.push(record);
                    }
                    Err(e) => {
                        debug!(key = %entry.key, error = %e, "skipping record");
                        summary.skip(&scope.id, &entry.key, e.to_string());
                    }
                }
            }
        }
        info!(records = records.len() - before, "scanned");
    }

    if summary.scopes_failed == scopes.len() {
        return Err(ExtractError::AllScopesUnavailable {
            count: scopes.len(),
        });
    }
    if summary.truncated {
        warn!("deadline passed; returning a partial extraction");
    }

    summary.records_decoded = records.len();
    let merged = merge(records);

    let mut conversations = Vec::with_capacity(merged.len());
    for conv in merged.values() {
        let Some(root) = build(conv) else {
            summary.conversations_empty += 1;
            continue;
        };
        for (_, node) in root.iter() {
            summary.nodes_orphaned += node.orphaned as usize;
            summary.nodes_cycle_broken += node.cycle_broken as usize;
        }
        let payload = &conv.canonical_payload;
        conversations.push(ConversationTree {
            id: conv.conversation_id.clone(),
            schema_kind: conv.schema_kind,
            title: payload.title.clone(),
            created_at: payload.created_at,
            updated_at: payload.updated_at,
            root,
        });
    }
    summary.conversations_produced = conversations.len();

    info!(
        conversations = summary.conversations_produced,
        skipped = summary.records_skipped,
        "extraction finished"
    );

    Ok(Extraction {
        conversations,
        merged,
        folders,
        summary,
    })
}
