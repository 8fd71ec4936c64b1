//! Reconciles records of the same conversation found in several scopes.
//!
//! Members of a group are ranked best-first by
//!
//! 1. completeness score (higher wins),
//! 2. scope (a workspace copy beats the global one),
//! 3. scan sequence (scanned later wins).
//!
//! Each canonical field, and each overflow key, is taken from the best-ranked
//! member that has it. The result only depends on the records and their
//! sequence numbers, so merging the same scan twice gives identical output.
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::model::{DecodedRecord, MergedConversation, Payload};

pub fn merge(
    records: impl IntoIterator<Item = DecodedRecord>,
) -> BTreeMap<String, MergedConversation> {
    let mut groups: BTreeMap<String, Vec<DecodedRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .filter_map(|(id, members)| merge_group(&id, members).map(|merged| (id, merged)))
        .collect()
}

fn rank(record: &DecodedRecord) -> (u32, bool, u64) {
    (
        record.completeness_score,
        record.scope_id.is_workspace(),
        record.sequence,
    )
}

fn merge_group(id: &str, mut members: Vec<DecodedRecord>) -> Option<MergedConversation> {
    members.sort_by(|a, b| rank(b).cmp(&rank(a)));
    let best = members.first()?;

    if members.iter().any(|m| m.schema_kind != best.schema_kind) {
        debug!(conversation = id, kind = %best.schema_kind, "records disagree on schema kind");
    }

    let canonical_payload = Payload {
        title: pick(id, "title", &members, |p| p.title.as_ref()),
        draft_text: pick(id, "draft_text", &members, |p| p.draft_text.as_ref()),
        created_at: pick(id, "created_at", &members, |p| p.created_at.as_ref()),
        updated_at: pick(id, "updated_at", &members, |p| p.updated_at.as_ref()),
        status: pick(id, "status", &members, |p| p.status.as_ref()),
        turns: pick(id, "turns", &members, |p| p.turns.as_ref()),
        overflow: union_overflow(id, &members),
    };

    let source_scopes: BTreeSet<_> = members.iter().map(|m| m.scope_id.clone()).collect();
    if members.len() > 1 {
        debug!(
            conversation = id,
            records = members.len(),
            scopes = source_scopes.len(),
            "merged duplicate records"
        );
    }

    Some(MergedConversation {
        conversation_id: id.to_string(),
        schema_kind: best.schema_kind,
        canonical_payload,
        source_scopes,
    })
}

/// Value of `field` from the best-ranked member that has one.
fn pick<T: Clone + PartialEq>(
    id: &str,
    field: &str,
    members: &[DecodedRecord],
    get: impl Fn(&Payload) -> Option<&T>,
) -> Option<T> {
    let mut present = members.iter().filter_map(|m| get(&m.payload).map(|v| (m, v)));
    let (winner, value) = present.next()?;
    for (other, v) in present {
        if v != value {
            debug!(
                conversation = id,
                field,
                kept = %winner.scope_id,
                dropped = %other.scope_id,
                "merge conflict"
            );
        }
    }
    Some(value.clone())
}

fn union_overflow(
    id: &str,
    members: &[DecodedRecord],
) -> BTreeMap<String, serde_json::Value> {
    let mut out = BTreeMap::new();
    for member in members {
        for (key, value) in &member.payload.overflow {
            match out.get(key) {
                None => {
                    out.insert(key.clone(), value.clone());
                }
                Some(kept) if kept != value => {
                    debug!(conversation = id, field = %key, "overflow conflict");
                }
                Some(_) => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, SchemaKind, ScopeId, Turn};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn turn(text: &str) -> Turn {
        Turn {
            id: None,
            role: Role::User,
            content: text.into(),
            timestamp: None,
            parent_ref: None,
            tool_calls: vec![],
            overflow: BTreeMap::new(),
        }
    }

    fn record(id: &str, scope: ScopeId, sequence: u64, payload: Payload) -> DecodedRecord {
        DecodedRecord {
            conversation_id: id.into(),
            schema_kind: SchemaKind::Composer,
            scope_id: scope,
            completeness_score: payload.completeness(),
            payload,
            sequence,
        }
    }

    fn ws(name: &str) -> ScopeId {
        ScopeId::Workspace(name.into())
    }

    #[test]
    fn more_complete_workspace_record_wins_overlaps() {
        let global = Payload {
            title: Some("global title".into()),
            status: Some("aborted".into()),
            draft_text: Some("only in global".into()),
            ..Default::default()
        };
        let workspace = Payload {
            title: Some("workspace title".into()),
            status: Some("completed".into()),
            created_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            turns: Some(vec![turn("hello")]),
            ..Default::default()
        };
        let records = vec![
            record("abc", ScopeId::Global, 0, global),
            record("abc", ws("workspace1"), 1, workspace),
        ];
        assert_eq!(records[0].completeness_score, 3);
        assert_eq!(records[1].completeness_score, 5);

        let merged = merge(records);
        let conv = &merged["abc"];
        let p = &conv.canonical_payload;
        assert_eq!(p.title.as_deref(), Some("workspace title"));
        assert_eq!(p.status.as_deref(), Some("completed"));
        assert_eq!(p.draft_text.as_deref(), Some("only in global"));
        assert_eq!(p.turns().len(), 1);
        assert_eq!(
            conv.source_scopes,
            BTreeSet::from([ScopeId::Global, ws("workspace1")])
        );
    }

    #[test]
    fn equal_scores_prefer_workspace_over_global() {
        let title = |t: &str| Payload {
            title: Some(t.into()),
            ..Default::default()
        };
        // Global scanned later must still lose to the workspace copy.
        let merged = merge(vec![
            record("x", ws("w"), 0, title("from workspace")),
            record("x", ScopeId::Global, 5, title("from global")),
        ]);
        assert_eq!(
            merged["x"].canonical_payload.title.as_deref(),
            Some("from workspace")
        );
    }

    #[test]
    fn equal_scores_and_scopes_prefer_later_scan() {
        let title = |t: &str| Payload {
            title: Some(t.into()),
            ..Default::default()
        };
        let merged = merge(vec![
            record("x", ws("a"), 1, title("earlier")),
            record("x", ws("b"), 2, title("later")),
        ]);
        assert_eq!(merged["x"].canonical_payload.title.as_deref(), Some("later"));
    }

    #[test]
    fn overflow_is_unioned_with_the_same_precedence() {
        let mut rich = Payload {
            title: Some("t".into()),
            status: Some("s".into()),
            ..Default::default()
        };
        rich.overflow.insert("unifiedMode".into(), json!("agent"));
        let mut poor = Payload::default();
        poor.overflow.insert("unifiedMode".into(), json!("chat"));
        poor.overflow.insert("context".into(), json!({"files": 1}));

        let merged = merge(vec![
            record("x", ScopeId::Global, 0, poor),
            record("x", ScopeId::Global, 1, rich),
        ]);
        let overflow = &merged["x"].canonical_payload.overflow;
        assert_eq!(overflow["unifiedMode"], json!("agent"));
        assert_eq!(overflow["context"], json!({"files": 1}));
    }

    #[test]
    fn distinct_ids_stay_separate() {
        let merged = merge(vec![
            record("b", ScopeId::Global, 0, Payload::default()),
            record("a", ScopeId::Global, 1, Payload::default()),
        ]);
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(merged["a"].source_scopes, BTreeSet::from([ScopeId::Global]));
    }

    #[test]
    fn merge_is_idempotent() {
        let build = || {
            vec![
                record(
                    "abc",
                    ScopeId::Global,
                    0,
                    Payload {
                        title: Some("g".into()),
                        turns: Some(vec![turn("a")]),
                        ..Default::default()
                    },
                ),
                record(
                    "abc",
                    ws("w1"),
                    1,
                    Payload {
                        title: Some("w".into()),
                        turns: Some(vec![turn("b")]),
                        ..Default::default()
                    },
                ),
            ]
        };
        let first = serde_json::to_string(&merge(build())).unwrap();
        let second = serde_json::to_string(&merge(build())).unwrap();
        assert_eq!(first, second);
    }
}
