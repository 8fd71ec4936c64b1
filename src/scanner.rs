//! Read-only access to Cursor's `state.vscdb` key-value stores.
//!
//! Cursor keeps its UI state in VS Code style SQLite files: a global one under
//! `globalStorage/` and one per opened folder under `workspaceStorage/<hash>/`.
//!
//! ```sql
//! CREATE TABLE ItemTable    (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB);
//! CREATE TABLE cursorDiskKV (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB); -- global only
//! ```
//!
//! Neither table declares a schema for its values; conversations are found by
//! matching keys against [`KeyPatterns`].
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::model::{SchemaKind, ScopeId};
use crate::utils::{open_read_only, snapshot_database};

const DB_FILE: &str = "state.vscdb";
const GLOBAL_DIR: &str = "globalStorage";
const WORKSPACE_DIR: &str = "workspaceStorage";

/// Tables that may hold conversation rows, in scan order.
const TABLES: [&str; 2] = ["ItemTable", "cursorDiskKV"];

#[derive(Debug, Error)]
pub enum ScanError {
    /// The backing file could not be opened or queried, typically because a
    /// running Cursor instance holds a lock on it.
    #[error("store for {scope} is unavailable: {reason}")]
    StoreUnavailable { scope: ScopeId, reason: String },
    /// The store opened fine but holds no conversation keys.
    #[error("no conversation keys in {scope}")]
    ScopeEmpty { scope: ScopeId },
    /// A matched row could not be read back.
    #[error("failed to read {key} from {scope}: {reason}")]
    ReadFailed {
        scope: ScopeId,
        key: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub id: ScopeId,
    pub db_path: PathBuf,
    /// Folder the workspace was opened on, from `workspace.json`.
    pub folder: Option<String>,
}

impl Scope {
    pub fn global(db_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ScopeId::Global,
            db_path: db_path.into(),
            folder: None,
        }
    }

    pub fn workspace(id: impl Into<String>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            id: ScopeId::Workspace(id.into()),
            db_path: db_path.into(),
            folder: None,
        }
    }
}

/// Cursor's `User` directory for the current platform.
pub fn default_storage_root() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Cursor").join("User"))
}

/// Find the global store and every workspace store below a `User` directory.
///
/// Workspaces are returned sorted by their storage directory name so repeated
/// runs merge in the same order.
pub fn discover_scopes(storage_root: &Path) -> Vec<Scope> {
    let mut scopes = Vec::new();

    let global = storage_root.join(GLOBAL_DIR).join(DB_FILE);
    if global.is_file() {
        scopes.push(Scope::global(global));
    }

    let Ok(entries) = fs::read_dir(storage_root.join(WORKSPACE_DIR)) else {
        return scopes;
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.join(DB_FILE).is_file())
        .collect();
    dirs.sort();

    for dir in dirs {
        let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let mut scope = Scope::workspace(name, dir.join(DB_FILE));
        scope.folder = read_workspace_folder(&dir);
        scopes.push(scope);
    }
    scopes
}

fn read_workspace_folder(dir: &Path) -> Option<String> {
    #[derive(Deserialize)]
    struct WorkspaceJson {
        folder: Option<String>,
        workspace: Option<String>,
    }

    let bytes = fs::read(dir.join("workspace.json")).ok()?;
    let parsed: WorkspaceJson = serde_json::from_slice(&bytes).ok()?;
    let uri = parsed.folder.or(parsed.workspace)?;
    match Url::parse(&uri) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
            .or(Some(uri)),
        _ => Some(uri),
    }
}

// ---------------------------------------------------------------------------
// Key patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Exact,
    Prefix,
    Contains,
}

/// How a matched value is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLayout {
    /// The value is one conversation.
    Single,
    /// The value is an object whose named field lists many conversations.
    Envelope(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    pub rule: MatchRule,
    pub text: String,
    /// Family the row is expected to hold; only consulted when sniffing is ambiguous.
    pub kind_hint: SchemaKind,
    pub layout: ValueLayout,
}

impl KeyPattern {
    pub fn new(rule: MatchRule, text: impl Into<String>, kind_hint: SchemaKind) -> Self {
        Self {
            rule,
            text: text.into(),
            kind_hint,
            layout: ValueLayout::Single,
        }
    }

    pub fn envelope(mut self, list_field: impl Into<String>) -> Self {
        self.layout = ValueLayout::Envelope(list_field.into());
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        match self.rule {
            MatchRule::Exact => key == self.text,
            MatchRule::Prefix => key.starts_with(&self.text),
            MatchRule::Contains => key.contains(&self.text),
        }
    }
}

/// An ordered set of key predicates; the first matching pattern claims a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPatterns(Vec<KeyPattern>);

impl KeyPatterns {
    pub fn new(patterns: Vec<KeyPattern>) -> Self {
        Self(patterns)
    }

    pub fn find(&self, key: &str) -> Option<&KeyPattern> {
        self.0.iter().find(|p| p.matches(key))
    }
}

impl Default for KeyPatterns {
    /// The rows Cursor has used for chat and composer history.
    fn default() -> Self {
        Self(vec![
            KeyPattern::new(
                MatchRule::Exact,
                "workbench.panel.aichat.view.aichat.chatdata",
                SchemaKind::Chat,
            )
            .envelope("tabs"),
            KeyPattern::new(
                MatchRule::Exact,
                "composer.composerData",
                SchemaKind::Composer,
            )
            .envelope("allComposers"),
            KeyPattern::new(MatchRule::Prefix, "composerData:", SchemaKind::Composer),
        ])
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// One matched row, exactly as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub scope_id: ScopeId,
    pub key: String,
    pub raw_value: Vec<u8>,
    pub kind_hint: SchemaKind,
    pub layout: ValueLayout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Read the live file, read-only.
    #[default]
    Direct,
    /// Read a private backup copy; the live file is only touched for the copy.
    Snapshot,
}

/// An open, read-only store. Dropping it closes the connection and removes
/// any snapshot file.
pub struct StoreHandle {
    scope: ScopeId,
    conn: Connection,
    tables: Vec<&'static str>,
    // Declared after `conn` so the connection closes before the file is removed.
    _snapshot: Option<NamedTempFile>,
}

impl StoreHandle {
    pub fn open(scope: &Scope, mode: OpenMode) -> Result<Self, ScanError> {
        let unavailable = |reason: String| ScanError::StoreUnavailable {
            scope: scope.id.clone(),
            reason,
        };

        if !scope.db_path.is_file() {
            return Err(unavailable(format!(
                "{} does not exist",
                scope.db_path.display()
            )));
        }

        let (conn, snapshot) = match mode {
            OpenMode::Direct => {
                let conn = open_read_only(&scope.db_path).map_err(|e| unavailable(e.to_string()))?;
                (conn, None)
            }
            OpenMode::Snapshot => {
                let tmp = snapshot_database(&scope.db_path)
                    .map_err(|e| unavailable(format!("{:#}", e)))?;
                let conn = open_read_only(tmp.path()).map_err(|e| unavailable(e.to_string()))?;
                (conn, Some(tmp))
            }
        };

        conn.busy_timeout(Duration::from_millis(250))
            .map_err(|e| unavailable(e.to_string()))?;

        // Opening is lazy in SQLite; the first real query surfaces locks and corruption.
        let tables = existing_tables(&conn).map_err(|e| unavailable(e.to_string()))?;

        Ok(Self {
            scope: scope.id.clone(),
            conn,
            tables,
            _snapshot: snapshot,
        })
    }

    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }

    /// Collect the matching keys and return an iterator that reads their values
    /// one row at a time. Consumes the handle; the store closes with the iterator.
    pub fn into_scan(self, patterns: &KeyPatterns) -> Result<ScanIter, ScanError> {
        let mut pending = Vec::new();
        for &table in &self.tables {
            let keys = list_keys(&self.conn, table).map_err(|e| ScanError::StoreUnavailable {
                scope: self.scope.clone(),
                reason: e.to_string(),
            })?;
            for key in keys {
                if let Some(pattern) = patterns.find(&key) {
                    pending.push(PendingRow {
                        table,
                        key,
                        kind_hint: pattern.kind_hint,
                        layout: pattern.layout.clone(),
                    });
                }
            }
        }

        if pending.is_empty() {
            return Err(ScanError::ScopeEmpty { scope: self.scope });
        }

        debug!(scope = %self.scope, keys = pending.len(), "matched conversation keys");
        Ok(ScanIter {
            handle: self,
            pending: pending.into_iter(),
        })
    }
}

/// Open `scope` afresh and scan it. Every call starts from a new connection.
pub fn scan(scope: &Scope, mode: OpenMode, patterns: &KeyPatterns) -> Result<ScanIter, ScanError> {
    StoreHandle::open(scope, mode)?.into_scan(patterns)
}

fn existing_tables(conn: &Connection) -> rusqlite::Result<Vec<&'static str>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;
    Ok(TABLES
        .into_iter()
        .filter(|t| names.iter().any(|n| n == t))
        .collect())
}

fn list_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("SELECT key FROM {} ORDER BY key", table))?;
    let mut rows = stmt.query([])?;
    let mut keys = Vec::new();
    while let Some(row) = rows.next()? {
        // Keys are TEXT in practice; anything else cannot match a pattern.
        if let ValueRef::Text(bytes) = row.get_ref(0)?
            && let Ok(key) = std::str::from_utf8(bytes)
        {
            keys.push(key.to_owned());
        }
    }
    Ok(keys)
}

struct PendingRow {
    table: &'static str,
    key: String,
    kind_hint: SchemaKind,
    layout: ValueLayout,
}

/// Lazily reads the values of the keys matched by a scan.
pub struct ScanIter {
    handle: StoreHandle,
    pending: std::vec::IntoIter<PendingRow>,
}

impl ScanIter {
    pub fn scope(&self) -> &ScopeId {
        self.handle.scope()
    }

    fn read_value(&self, row: &PendingRow) -> rusqlite::Result<Vec<u8>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", row.table);
        self.handle.conn.query_row(&sql, [&row.key], |r| {
            Ok(match r.get_ref(0)? {
                ValueRef::Text(b) | ValueRef::Blob(b) => b.to_vec(),
                ValueRef::Integer(i) => i.to_string().into_bytes(),
                ValueRef::Real(f) => f.to_string().into_bytes(),
                ValueRef::Null => Vec::new(),
            })
        })
    }
}

impl Iterator for ScanIter {
    type Item = Result<RawEntry, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.pending.next()?;
        Some(match self.read_value(&row) {
            Ok(raw_value) => Ok(RawEntry {
                scope_id: self.handle.scope.clone(),
                key: row.key,
                raw_value,
                kind_hint: row.kind_hint,
                layout: row.layout,
            }),
            Err(e) => Err(ScanError::ReadFailed {
                scope: self.handle.scope.clone(),
                key: row.key,
                reason: e.to_string(),
            }),
        })
    }
}
