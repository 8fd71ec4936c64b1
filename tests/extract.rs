use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use cursor_chat_export::exporter::{Export, read_export_file, write_export_file};
use cursor_chat_export::model::{Role, SchemaKind, ScopeId};
use cursor_chat_export::pipeline::{ExtractError, ExtractOptions, extract};
use cursor_chat_export::renderer::write_markdown;
use cursor_chat_export::scanner::{OpenMode, discover_scopes};
use rusqlite::Connection;
use tempfile::TempDir;

const CHAT_KEY: &str = "workbench.panel.aichat.view.aichat.chatdata";

fn create_store(path: &Path, item_rows: &[(&str, &str)], disk_rows: &[(&str, &str)]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB);
         CREATE TABLE cursorDiskKV (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB);",
    )
    .unwrap();
    for (key, value) in item_rows {
        conn.execute("INSERT INTO ItemTable (key, value) VALUES (?1, ?2)", [key, value])
            .unwrap();
    }
    for (key, value) in disk_rows {
        conn.execute("INSERT INTO cursorDiskKV (key, value) VALUES (?1, ?2)", [key, value])
            .unwrap();
    }
}

/// A `User` directory with one global store and one workspace store.
fn fixture() -> TempDir {
    let root = tempfile::tempdir().unwrap();

    create_store(
        &root.path().join("globalStorage/state.vscdb"),
        &[],
        &[
            (
                "composerData:abc",
                r#"{"composerId":"abc","name":"global title","status":"aborted","text":"only in global"}"#,
            ),
            ("composerData:broken", "{oops"),
        ],
    );

    let ws = root.path().join("workspaceStorage/ws1");
    create_store(
        &ws.join("state.vscdb"),
        &[
            (
                "composer.composerData",
                r#"{"allComposers":[{
                    "composerId":"abc","name":"workspace title","status":"completed",
                    "createdAt":1704067200000,"lastUpdatedAt":1704153600000,
                    "conversation":[
                        {"type":1,"bubbleId":"u1","text":"hello"},
                        {"type":2,"bubbleId":"a1","text":"hi there",
                         "toolFormerData":{"toolCallId":"call-1","name":"read_file","result":"fn main() {}"}}
                    ]}]}"#,
            ),
            (
                CHAT_KEY,
                r#"{"tabs":[{
                    "tabId":"tab-1","chatTitle":"Branching","lastSendTime":1704067200000,
                    "bubbles":[
                        {"id":"m1","type":"user","text":"question"},
                        {"id":"m2","type":"ai","text":"answer"},
                        {"id":"m3","type":"user","text":"follow-up"},
                        {"id":"m2b","type":"ai","text":"regenerated","parentBubbleId":"m1"}
                    ]}]}"#,
            ),
        ],
        &[],
    );
    fs::write(
        ws.join("workspace.json"),
        r#"{"folder":"file:///home/dev/project"}"#,
    )
    .unwrap();

    root
}

#[test]
fn merges_global_and_workspace_copies() {
    let root = fixture();
    let scopes = discover_scopes(root.path());
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[0].id, ScopeId::Global);

    let out = extract(&scopes, &ExtractOptions::default()).unwrap();
    assert_eq!(out.summary.scopes_scanned, 2);
    assert_eq!(out.summary.scopes_failed, 0);
    assert_eq!(out.summary.records_decoded, 3);
    assert_eq!(out.summary.records_skipped, 1);
    assert_eq!(out.summary.skip_reasons[0].key, "composerData:broken");
    assert_eq!(out.summary.conversations_produced, 2);

    let merged = &out.merged["abc"];
    assert_eq!(merged.schema_kind, SchemaKind::Composer);
    assert_eq!(
        merged.source_scopes,
        BTreeSet::from([ScopeId::Global, ScopeId::Workspace("ws1".into())])
    );
    let payload = &merged.canonical_payload;
    assert_eq!(payload.title.as_deref(), Some("workspace title"));
    assert_eq!(payload.status.as_deref(), Some("completed"));
    assert_eq!(payload.draft_text.as_deref(), Some("only in global"));

    if cfg!(unix) {
        assert_eq!(out.folders_of("abc"), vec!["/home/dev/project"]);
    }

    let composer = out.conversations.iter().find(|c| c.id == "abc").unwrap();
    let ids: Vec<&str> = composer.root.iter().map(|(_, n)| n.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "a1", "call-1"]);
    let tool = &composer.root.children[0].children[0];
    assert_eq!(tool.role, Role::Tool);
    assert_eq!(tool.tool_name.as_deref(), Some("read_file"));
    assert_eq!(tool.content, "fn main() {}");
}

#[test]
fn regenerated_reply_becomes_a_branch() {
    let root = fixture();
    let out = extract(&discover_scopes(root.path()), &ExtractOptions::default()).unwrap();
    let chat = out.conversations.iter().find(|c| c.id == "tab-1").unwrap();

    assert_eq!(chat.schema_kind, SchemaKind::Chat);
    assert_eq!(chat.title.as_deref(), Some("Branching"));
    assert_eq!(chat.root.id, "m1");
    let children: Vec<&str> = chat.root.children.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(children, vec!["m2", "m2b"]);
    assert_eq!(chat.root.children[0].children[0].id, "m3");
    assert_eq!(chat.root.node_count(), 4);
    assert!(chat.root.iter().all(|(_, n)| !n.orphaned && !n.cycle_broken));
}

#[test]
fn snapshot_mode_reads_the_same_data() {
    let root = fixture();
    let scopes = discover_scopes(root.path());
    let direct = extract(&scopes, &ExtractOptions::default()).unwrap();
    let snapshot = extract(
        &scopes,
        &ExtractOptions {
            mode: OpenMode::Snapshot,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(direct.conversations, snapshot.conversations);
    assert_eq!(direct.summary, snapshot.summary);
}

#[test]
fn json_export_round_trips() {
    let root = fixture();
    let out = extract(&discover_scopes(root.path()), &ExtractOptions::default()).unwrap();
    let export = Export {
        conversations: out.conversations.clone(),
    };

    let file = root.path().join("export/cursor-chats.json");
    write_export_file(&file, &export).unwrap();
    let back = read_export_file(&file).unwrap();
    assert_eq!(back.conversations.len(), 2);

    let chat = back.conversations.iter().find(|c| c.id == "tab-1").unwrap();
    let m3 = &chat.root.children[0].children[0];
    assert_eq!(m3.parent_id.as_deref(), Some("m2"));

    assert_eq!(back, export);
}

#[test]
fn long_linear_chat_survives_export_and_reload() {
    const STEPS: usize = 100_000;
    let steps: Vec<String> = (0..STEPS)
        .map(|i| format!(r#"{{"type":{},"bubbleId":"b{}","text":"step {}"}}"#, i % 2 + 1, i, i))
        .collect();
    let body = format!(r#"{{"composerId":"long","conversation":[{}]}}"#, steps.join(","));

    let root = tempfile::tempdir().unwrap();
    create_store(
        &root.path().join("globalStorage/state.vscdb"),
        &[],
        &[("composerData:long", body.as_str())],
    );
    let out = extract(&discover_scopes(root.path()), &ExtractOptions::default()).unwrap();
    let export = Export {
        conversations: out.conversations,
    };
    let tree = &export.conversations[0];
    assert_eq!(tree.root.node_count(), STEPS);
    let (depth, last) = tree.root.iter().last().unwrap();
    assert_eq!(depth, STEPS - 1);
    assert_eq!(last.id, "b99999");

    let file = root.path().join("long.json");
    write_export_file(&file, &export).unwrap();
    let back = read_export_file(&file).unwrap();
    let (_, last) = back.conversations[0].root.iter().last().unwrap();
    assert_eq!(last.parent_id.as_deref(), Some("b99998"));
    assert!(back == export);
    drop(back);
    drop(export);
}

#[test]
fn markdown_is_written_once_then_skipped() {
    let root = fixture();
    let out = extract(&discover_scopes(root.path()), &ExtractOptions::default()).unwrap();
    let md_dir = root.path().join("md");

    let first = write_markdown(&out, &md_dir, false).unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(first.errors, 0);

    let chat_file = md_dir.join("tab-1_branching.md");
    let text = fs::read_to_string(&chat_file).unwrap();
    assert!(text.starts_with("---\nid: tab-1\n"));
    assert!(text.contains("> Branch 2 of 2"));
    assert!(md_dir.join("abc_workspace-title.md").exists());

    let second = write_markdown(&out, &md_dir, false).unwrap();
    assert_eq!(second.skipped, 2);

    let forced = write_markdown(&out, &md_dir, true).unwrap();
    assert_eq!(forced.updated, 2);
}

#[test]
fn empty_storage_root_has_no_scopes() {
    let root = tempfile::tempdir().unwrap();
    let scopes = discover_scopes(root.path());
    assert!(scopes.is_empty());
    assert!(matches!(
        extract(&scopes, &ExtractOptions::default()),
        Err(ExtractError::NoScopes)
    ));
}

#[test]
fn unreadable_stores_fail_the_run() {
    let root = tempfile::tempdir().unwrap();
    let global = root.path().join("globalStorage/state.vscdb");
    fs::create_dir_all(global.parent().unwrap()).unwrap();
    fs::write(&global, b"this is not a sqlite database, just bytes padded out").unwrap();

    let scopes = discover_scopes(root.path());
    assert_eq!(scopes.len(), 1);
    assert!(matches!(
        extract(&scopes, &ExtractOptions::default()),
        Err(ExtractError::AllScopesUnavailable { count: 1 })
    ));
}
