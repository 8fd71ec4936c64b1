//! Schema sniffing and alias normalization of raw store values.
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::model::{DecodedRecord, Payload, Role, SchemaKind, ToolCall, Turn};
use crate::scanner::{RawEntry, ValueLayout};
use crate::schema::{self, CHAT, COMPOSER, SchemaRules, tool_call, turn};
use crate::utils::parse_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The value is not JSON, even after repair.
    #[error("unparseable value: {0}")]
    Unparseable(String),
    /// Valid JSON, but no marker of either record family.
    #[error("no known schema marker")]
    UnknownSchema,
    #[error("{kind} record has no conversation id")]
    MissingId { kind: SchemaKind },
}

/// Decode a row that holds exactly one conversation.
///
/// Envelope rows are decoded as a whole, which only succeeds when the envelope
/// object itself carries schema markers; use [`decode_entry`] for those.
pub fn decode(raw: &RawEntry) -> Result<DecodedRecord, DecodeError> {
    let value = parse_value(&raw.raw_value)?;
    decode_value(raw, &value, key_suffix(&raw.key))
}

/// Decode any matched row into one result per contained conversation.
pub fn decode_entry(raw: &RawEntry) -> Vec<Result<DecodedRecord, DecodeError>> {
    let list_field = match &raw.layout {
        ValueLayout::Single => return vec![decode(raw)],
        ValueLayout::Envelope(field) => field,
    };

    let value = match parse_value(&raw.raw_value) {
        Ok(v) => v,
        Err(e) => return vec![Err(e)],
    };

    match value.get(list_field.as_str()) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| decode_value(raw, item, None))
            .collect(),
        // Older builds stored a bare conversation where the envelope is now.
        _ => vec![decode_value(raw, &value, None)],
    }
}

/// The id embedded in keys like `composerData:<id>`.
fn key_suffix(key: &str) -> Option<&str> {
    key.rsplit_once(':')
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
}

fn parse_value(bytes: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|e| DecodeError::Unparseable(e.to_string()))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(DecodeError::Unparseable("empty value".into()));
    }

    match serde_json::from_str(text) {
        Ok(v) => Ok(v),
        Err(first) => {
            let repaired = strip_trailing_commas(text);
            if repaired.len() != text.len()
                && let Ok(v) = serde_json::from_str(&repaired)
            {
                debug!("repaired trailing commas in stored value");
                return Ok(v);
            }
            Err(DecodeError::Unparseable(first.to_string()))
        }
    }
}

/// Drop commas that directly precede `}` or `]`, leaving string literals alone.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = text[i + 1..].trim_start().chars().next();
                if !matches!(next, Some('}' | ']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn sniff(obj: &Map<String, Value>, hint: SchemaKind) -> Result<SchemaKind, DecodeError> {
    let marked = |rules: &SchemaRules| rules.markers.iter().any(|m| obj.contains_key(*m));
    match (marked(&COMPOSER), marked(&CHAT)) {
        (true, false) => Ok(SchemaKind::Composer),
        (false, true) => Ok(SchemaKind::Chat),
        (true, true) => Ok(hint),
        (false, false) => Err(DecodeError::UnknownSchema),
    }
}

fn decode_value(
    raw: &RawEntry,
    value: &Value,
    key_id: Option<&str>,
) -> Result<DecodedRecord, DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::UnknownSchema)?;
    let kind = sniff(obj, raw.kind_hint)?;
    let rules = schema::rules(kind);

    let mut fields = FieldReader::new(obj);
    let conversation_id = fields
        .take(rules.id, ident)
        .or_else(|| key_id.map(str::to_owned))
        .ok_or(DecodeError::MissingId { kind })?;

    let payload = Payload {
        title: fields.take(rules.title, non_empty_str),
        draft_text: fields.take(rules.draft_text, non_empty_str),
        created_at: fields.take(rules.created_at, parse_timestamp),
        updated_at: fields.take(rules.updated_at, parse_timestamp),
        status: fields.take(rules.status, non_empty_str),
        turns: fields
            .take_list(rules.turns)
            .map(|items| decode_turns(items, &conversation_id))
            .filter(|turns| !turns.is_empty()),
        overflow: fields.overflow(),
    };

    Ok(DecodedRecord {
        completeness_score: payload.completeness(),
        conversation_id,
        schema_kind: kind,
        scope_id: raw.scope_id.clone(),
        payload,
        sequence: 0,
    })
}

fn decode_turns(items: &[Value], conversation_id: &str) -> Vec<Turn> {
    let turns: Vec<Turn> = items
        .iter()
        .filter_map(Value::as_object)
        .filter(|obj| !obj.is_empty())
        .map(decode_turn)
        .collect();
    let dropped = items.len() - turns.len();
    if dropped > 0 {
        debug!(conversation = conversation_id, dropped, "ignored empty turns");
    }
    turns
}

fn decode_turn(obj: &Map<String, Value>) -> Turn {
    let mut fields = FieldReader::new(obj);
    let id = fields.take(turn::ID, ident);
    let role = fields.take(turn::ROLE, role_of);
    let content = fields.take(turn::CONTENT, text_of).unwrap_or_default();
    let timestamp = fields.take(turn::TIMESTAMP, parse_timestamp);
    let parent_ref = fields.take(turn::PARENT, ident);

    let mut tool_calls: Vec<ToolCall> = fields
        .take_list(turn::TOOL_CALL_LISTS)
        .map(|calls| {
            calls
                .iter()
                .filter_map(Value::as_object)
                .filter_map(decode_tool_call)
                .collect()
        })
        .unwrap_or_default();
    if let Some(call) = fields
        .take(turn::TOOL_CALL_SINGLE, Value::as_object)
        .and_then(decode_tool_call)
    {
        tool_calls.push(call);
    }

    Turn {
        id,
        // Unlabelled turns are replies; only user input is reliably tagged.
        role: role.unwrap_or(Role::Assistant),
        content,
        timestamp,
        parent_ref,
        tool_calls,
        overflow: fields.overflow(),
    }
}

fn decode_tool_call(obj: &Map<String, Value>) -> Option<ToolCall> {
    if obj.is_empty() {
        return None;
    }
    let mut fields = FieldReader::new(obj);
    let id = fields.take(tool_call::ID, ident);
    let name = fields
        .take(tool_call::NAME, non_empty_str)
        .unwrap_or_else(|| "tool".to_string());
    let content = fields
        .take(tool_call::RESULT, text_or_json)
        .or_else(|| fields.take(tool_call::ARGS, text_or_json))
        .unwrap_or_default();
    let timestamp = fields.take(tool_call::TIMESTAMP, parse_timestamp);
    Some(ToolCall {
        id,
        name,
        content,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

/// Reads aliased fields from one JSON object and remembers which keys were used.
struct FieldReader<'a> {
    obj: &'a Map<String, Value>,
    consumed: BTreeSet<&'static str>,
}

impl<'a> FieldReader<'a> {
    fn new(obj: &'a Map<String, Value>) -> Self {
        Self {
            obj,
            consumed: BTreeSet::new(),
        }
    }

    /// First alias whose value converts, in alias order.
    fn take<T>(
        &mut self,
        aliases: &[&'static str],
        convert: impl Fn(&'a Value) -> Option<T>,
    ) -> Option<T> {
        for &alias in aliases {
            if let Some(value) = self.obj.get(alias)
                && let Some(out) = convert(value)
            {
                self.consumed.insert(alias);
                return Some(out);
            }
        }
        None
    }

    /// First non-empty array among the aliases. Empty arrays are consumed too,
    /// so they do not resurface in overflow.
    fn take_list(&mut self, aliases: &[&'static str]) -> Option<&'a Vec<Value>> {
        for &alias in aliases {
            if let Some(Value::Array(items)) = self.obj.get(alias) {
                self.consumed.insert(alias);
                if !items.is_empty() {
                    return Some(items);
                }
            }
        }
        None
    }

    fn overflow(&self) -> BTreeMap<String, Value> {
        self.obj
            .iter()
            .filter(|(k, _)| !self.consumed.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
}

/// Identifiers are strings in current builds and occasionally numbers in old ones.
fn ident(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        other => non_empty_str(other),
    }
}

fn role_of(value: &Value) -> Option<Role> {
    match value {
        Value::Number(n) => match n.as_i64()? {
            1 => Some(Role::User),
            2 => Some(Role::Assistant),
            _ => None,
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Role::User),
            "ai" | "assistant" | "bot" | "model" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        },
        _ => None,
    }
}

/// Plain text, or the text parts of a structured content array.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(o) => o.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

fn text_or_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => (!s.is_empty()).then(|| s.clone()),
        Value::Object(m) if m.is_empty() => None,
        Value::Array(a) if a.is_empty() => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScopeId;
    use serde_json::json;

    fn entry(key: &str, value: &str, hint: SchemaKind, layout: ValueLayout) -> RawEntry {
        RawEntry {
            scope_id: ScopeId::Global,
            key: key.into(),
            raw_value: value.as_bytes().to_vec(),
            kind_hint: hint,
            layout,
        }
    }

    fn single(value: &Value) -> RawEntry {
        entry(
            "composerData:fallback",
            &value.to_string(),
            SchemaKind::Composer,
            ValueLayout::Single,
        )
    }

    #[test]
    fn chat_record_scores_its_canonical_fields() {
        let raw = single(&json!({
            "tabId": "t1",
            "chatTitle": "Fix the build",
            "lastSendTime": 1616161616161_i64,
            "bubbles": [
                {"type": "user", "text": "why does it fail?"},
                {"type": "ai", "text": "missing feature flag"}
            ]
        }));
        let rec = decode(&raw).unwrap();
        assert_eq!(rec.schema_kind, SchemaKind::Chat);
        assert_eq!(rec.conversation_id, "t1");
        assert_eq!(rec.completeness_score, 3);
        assert_eq!(rec.payload.title.as_deref(), Some("Fix the build"));
        let turns = rec.payload.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert!(rec.payload.overflow.is_empty());
    }

    #[test]
    fn composer_record_scores_all_six_fields() {
        let raw = single(&json!({
            "composerId": "c1",
            "name": "Refactor",
            "text": "draft",
            "createdAt": 1616161616161_i64,
            "lastUpdatedAt": 1616161617161_i64,
            "status": "completed",
            "conversation": [
                {"type": 1, "bubbleId": "b1", "text": "do it"},
                {"type": 2, "bubbleId": "b2", "text": "done",
                 "toolFormerData": {"name": "edit_file", "rawArgs": "{\"path\":\"a.rs\"}"}}
            ]
        }));
        let rec = decode(&raw).unwrap();
        assert_eq!(rec.schema_kind, SchemaKind::Composer);
        assert_eq!(rec.completeness_score, 6);
        let step = &rec.payload.turns()[1];
        assert_eq!(step.id.as_deref(), Some("b2"));
        assert_eq!(step.tool_calls.len(), 1);
        assert_eq!(step.tool_calls[0].name, "edit_file");
        assert_eq!(step.tool_calls[0].content, "{\"path\":\"a.rs\"}");
    }

    #[test]
    fn header_only_composer_is_a_partial_record() {
        let rec = decode(&single(&json!({
            "composerId": "c1",
            "name": "Refactor",
            "createdAt": 1616161616161_i64,
            "conversation": []
        })))
        .unwrap();
        assert_eq!(rec.completeness_score, 2);
        assert!(rec.payload.turns.is_none());
        assert!(rec.payload.overflow.is_empty());
    }

    #[test]
    fn conversation_headers_give_a_turn_skeleton() {
        let rec = decode(&single(&json!({
            "composerId": "c1",
            "fullConversationHeadersOnly": [
                {"bubbleId": "b1", "type": 1},
                {"bubbleId": "b2", "type": 2}
            ]
        })))
        .unwrap();
        let turns = rec.payload.turns();
        let skeleton: Vec<(Option<&str>, Role)> =
            turns.iter().map(|t| (t.id.as_deref(), t.role)).collect();
        assert_eq!(skeleton, vec![(Some("b1"), Role::User), (Some("b2"), Role::Assistant)]);
        assert!(turns.iter().all(|t| t.content.is_empty()));
        assert!(rec.payload.overflow.is_empty());
    }

    #[test]
    fn full_conversation_wins_over_headers() {
        let rec = decode(&single(&json!({
            "composerId": "c1",
            "conversation": [{"bubbleId": "b1", "type": 1, "text": "hello"}],
            "fullConversationHeadersOnly": [{"bubbleId": "b1", "type": 1}]
        })))
        .unwrap();
        assert_eq!(rec.payload.turns()[0].content, "hello");
        assert!(rec.payload.overflow.contains_key("fullConversationHeadersOnly"));
    }

    #[test]
    fn first_alias_wins_and_losers_overflow() {
        let rec = decode(&single(&json!({
            "tabId": "t1",
            "chatTitle": "primary",
            "title": "secondary",
            "futureField": {"x": 1}
        })))
        .unwrap();
        assert_eq!(rec.payload.title.as_deref(), Some("primary"));
        assert_eq!(rec.payload.overflow.get("title"), Some(&json!("secondary")));
        assert_eq!(rec.payload.overflow.get("futureField"), Some(&json!({"x": 1})));
    }

    #[test]
    fn empty_strings_fall_through_to_next_alias() {
        let rec = decode(&single(&json!({
            "tabId": "t1",
            "chatTitle": "",
            "title": "fallback"
        })))
        .unwrap();
        assert_eq!(rec.payload.title.as_deref(), Some("fallback"));
    }

    #[test]
    fn id_falls_back_to_key_suffix() {
        let rec = decode(&single(&json!({"conversation": [{"type": 1, "text": "hi"}]}))).unwrap();
        assert_eq!(rec.conversation_id, "fallback");
    }

    #[test]
    fn envelope_member_without_id_is_rejected() {
        let raw = entry(
            "workbench.panel.aichat.view.aichat.chatdata",
            r#"{"tabs":[{"bubbles":[{"type":"user","text":"hi"}]}]}"#,
            SchemaKind::Chat,
            ValueLayout::Envelope("tabs".into()),
        );
        let results = decode_entry(&raw);
        assert_eq!(
            results,
            vec![Err(DecodeError::MissingId {
                kind: SchemaKind::Chat
            })]
        );
    }

    #[test]
    fn garbage_is_unparseable() {
        let raw = entry("composerData:x", "{\"composerId\": ", SchemaKind::Composer, ValueLayout::Single);
        assert!(matches!(decode(&raw), Err(DecodeError::Unparseable(_))));

        let raw = RawEntry {
            raw_value: vec![0xff, 0xfe, 0x00],
            ..raw
        };
        assert!(matches!(decode(&raw), Err(DecodeError::Unparseable(_))));
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let raw = entry(
            "composerData:x",
            r#"{"composerId": "c1", "name": "a, b,", "conversation": [{"type": 1, "text": "x"},],}"#,
            SchemaKind::Composer,
            ValueLayout::Single,
        );
        let rec = decode(&raw).unwrap();
        assert_eq!(rec.payload.title.as_deref(), Some("a, b,"));
        assert_eq!(rec.payload.turns().len(), 1);
    }

    #[test]
    fn unmarked_values_are_unknown_schema() {
        assert_eq!(
            decode(&single(&json!({"editor.fontSize": 14}))),
            Err(DecodeError::UnknownSchema)
        );
        assert_eq!(decode(&single(&json!([1, 2, 3]))), Err(DecodeError::UnknownSchema));
    }

    #[test]
    fn ambiguous_markers_defer_to_the_key_hint() {
        let value = json!({"tabId": "t1", "composerId": "c1"}).to_string();
        let as_chat = entry("k", &value, SchemaKind::Chat, ValueLayout::Single);
        let as_composer = entry("k", &value, SchemaKind::Composer, ValueLayout::Single);
        assert_eq!(decode(&as_chat).unwrap().schema_kind, SchemaKind::Chat);
        assert_eq!(decode(&as_composer).unwrap().conversation_id, "c1");
    }

    #[test]
    fn envelope_yields_one_result_per_member() {
        let raw = entry(
            "workbench.panel.aichat.view.aichat.chatdata",
            &json!({
                "tabs": [
                    {"tabId": "a", "bubbles": [{"type": "user", "text": "one"}]},
                    {"tabId": "b", "chatTitle": "second"},
                    42
                ]
            })
            .to_string(),
            SchemaKind::Chat,
            ValueLayout::Envelope("tabs".into()),
        );
        let results = decode_entry(&raw);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().conversation_id, "a");
        assert_eq!(results[1].as_ref().unwrap().conversation_id, "b");
        assert_eq!(results[2], Err(DecodeError::UnknownSchema));
    }

    #[test]
    fn turn_content_and_roles_follow_aliases() {
        let rec = decode(&single(&json!({
            "composerId": "c1",
            "conversation": [
                null,
                {},
                {"role": "user", "content": [{"type": "text", "text": "part one"}, "part two"]},
                {"role": "tool", "message": "ok", "timestamp": "2024-05-01T10:00:00Z"},
                {"type": 7, "text": "odd type", "parentBubbleId": "b0",
                 "toolCalls": [{"toolName": "grep", "output": {"hits": 2}}, {}]}
            ]
        })))
        .unwrap();
        let turns = rec.payload.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "part one\npart two");
        assert_eq!(turns[1].role, Role::Tool);
        assert!(turns[1].timestamp.is_some());
        assert_eq!(turns[2].role, Role::Assistant);
        assert_eq!(turns[2].parent_ref.as_deref(), Some("b0"));
        assert_eq!(turns[2].tool_calls.len(), 1);
        assert_eq!(turns[2].tool_calls[0].name, "grep");
        assert_eq!(turns[2].tool_calls[0].content, r#"{"hits":2}"#);
    }

    #[test]
    fn strip_trailing_commas_respects_strings() {
        assert_eq!(strip_trailing_commas(r#"[1, 2, ]"#), "[1, 2 ]");
        assert_eq!(strip_trailing_commas(r#"{"a": ",}"}"#), r#"{"a": ",}"}"#);
        assert_eq!(strip_trailing_commas(r#"{"a": "\",", }"#), r#"{"a": "\"," }"#);
    }
}
