//! Static knowledge about the two Cursor conversation record families.
//!
//! Cursor has never documented these payloads and has renamed fields between
//! releases. Every logical field therefore maps to a priority-ordered alias
//! list: the decoder takes the first alias that is present and non-empty.
//!
//! ## Chat (sidebar "AI chat" panel)
//!
//! Stored per workspace in `ItemTable` under
//! `workbench.panel.aichat.view.aichat.chatdata`:
//!
//! ```json
//! { "tabs": [ { "tabId": "…", "chatTitle": "…", "lastSendTime": 1616161616161,
//!               "bubbles": [ { "type": "user", "text": "…" },
//!                            { "type": "ai",   "text": "…" } ] } ] }
//! ```
//!
//! ## Composer (composer / agent panel)
//!
//! Headers live in `ItemTable` under `composer.composerData` (`allComposers`),
//! full bodies in the global `cursorDiskKV` table under `composerData:<id>`:
//!
//! ```json
//! { "composerId": "…", "name": "…", "createdAt": 1616161616161,
//!   "lastUpdatedAt": 1616161616161, "status": "completed",
//!   "conversation": [ { "type": 1, "bubbleId": "…", "text": "…" },
//!                     { "type": 2, "bubbleId": "…", "text": "…",
//!                       "toolFormerData": { "name": "read_file", "rawArgs": "…", "result": "…" } } ] }
//! ```
//!
//! A header and a body for the same composer are two partial records of one
//! conversation; the merger unions them.
use crate::model::SchemaKind;

type Aliases = &'static [&'static str];

/// Field aliases for one record family.
#[derive(Debug)]
pub struct SchemaRules {
    pub kind: SchemaKind,
    /// Presence of any of these top-level fields identifies the family.
    pub markers: Aliases,
    pub id: Aliases,
    pub title: Aliases,
    pub draft_text: Aliases,
    pub created_at: Aliases,
    pub updated_at: Aliases,
    pub status: Aliases,
    pub turns: Aliases,
}

impl SchemaRules {
    /// Every top-level name some alias list claims. Anything else goes to overflow.
    pub fn claimed(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            self.id,
            self.title,
            self.draft_text,
            self.created_at,
            self.updated_at,
            self.status,
            self.turns,
        ]
        .into_iter()
        .flatten()
        .copied()
    }
}

pub const CHAT: SchemaRules = SchemaRules {
    kind: SchemaKind::Chat,
    markers: &["tabId", "bubbles", "chatTitle"],
    id: &["tabId", "chatId", "id"],
    title: &["chatTitle", "title", "name"],
    draft_text: &[],
    created_at: &["createdAt", "created_at"],
    updated_at: &["lastSendTime", "lastUpdatedAt", "updatedAt"],
    status: &[],
    turns: &["bubbles", "messages"],
};

pub const COMPOSER: SchemaRules = SchemaRules {
    kind: SchemaKind::Composer,
    markers: &[
        "composerId",
        "conversation",
        "fullConversationHeadersOnly",
        "interactions",
    ],
    id: &["composerId", "id"],
    title: &["name", "title"],
    draft_text: &["text"],
    created_at: &["createdAt", "created_at"],
    updated_at: &["lastUpdatedAt", "updatedAt", "lastSendTime"],
    status: &["status"],
    turns: &[
        "conversation",
        "history",
        "interactions",
        "messages",
        "fullConversationHeadersOnly",
    ],
};

pub fn rules(kind: SchemaKind) -> &'static SchemaRules {
    match kind {
        SchemaKind::Chat => &CHAT,
        SchemaKind::Composer => &COMPOSER,
    }
}

/// Aliases inside one message or step.
pub mod turn {
    use super::Aliases;

    pub const ID: Aliases = &["bubbleId", "id", "messageId"];
    /// `type` is numeric in composer steps (1 = user, 2 = assistant) and a
    /// string in chat bubbles (`"user"`, `"ai"`).
    pub const ROLE: Aliases = &["type", "role", "author"];
    pub const CONTENT: Aliases = &["text", "content", "message", "rawText"];
    pub const TIMESTAMP: Aliases = &["timestamp", "createdAt", "time"];
    /// Explicit branch markers. Older records carry none and are linear.
    pub const PARENT: Aliases = &["parentBubbleId", "parentId", "alternateParentId"];
    pub const TOOL_CALL_LISTS: Aliases = &["toolCalls", "tool_calls", "toolResults"];
    /// A single tool call stored inline on the step.
    pub const TOOL_CALL_SINGLE: Aliases = &["toolFormerData"];
}

/// Aliases inside one tool call.
pub mod tool_call {
    use super::Aliases;

    pub const ID: Aliases = &["toolCallId", "tool_call_id", "id"];
    pub const NAME: Aliases = &["name", "toolName", "tool"];
    pub const RESULT: Aliases = &["result", "output", "content"];
    pub const ARGS: Aliases = &["rawArgs", "arguments", "args", "input", "params"];
    pub const TIMESTAMP: Aliases = &["timestamp", "createdAt"];
}
