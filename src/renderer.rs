//! Markdown rendering: one file per conversation with YAML frontmatter.
//!
//! Files are named `<id prefix>_<slug>.md`. Re-running over the same directory
//! only rewrites conversations whose `updated_at` moved past the one recorded in
//! the file's frontmatter; a changed title renames the file in place.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{ConversationNode, ConversationTree, Role, SchemaKind};
use crate::pipeline::Extraction;
use crate::utils::{ProcessResult, parse_existing_frontmatter};

const TITLE_MAX_CHARS: usize = 80;

#[derive(Serialize)]
struct Frontmatter<'a> {
    id: &'a str,
    title: &'a str,
    kind: SchemaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "is_empty")]
    scopes: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    folders: &'a [&'a str],
}

fn is_empty<T>(items: &&[T]) -> bool {
    items.is_empty()
}

/// Per-conversation metadata that is not part of the tree itself.
pub struct RenderContext<'a> {
    pub title: &'a str,
    pub scopes: &'a [String],
    pub folders: &'a [&'a str],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Title shown for a conversation: its own title, else the first line of the
/// unsent draft, else a name derived from the id.
pub fn display_title(tree: &ConversationTree, draft_text: Option<&str>) -> String {
    if let Some(title) = tree.title.as_deref().map(str::trim)
        && !title.is_empty()
    {
        return title.to_string();
    }
    if let Some(line) = draft_text
        .and_then(|d| d.lines().map(str::trim).find(|l| !l.is_empty()))
    {
        return truncate_chars(line, TITLE_MAX_CHARS);
    }
    let short = tree.id.get(..8).unwrap_or(&tree.id);
    match tree.schema_kind {
        SchemaKind::Chat => format!("Chat {}", short),
        SchemaKind::Composer => format!("Composer {}", short),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", s[..cut].trim_end()),
        None => s.to_string(),
    }
}

/// A fence longer than any backtick run inside `content`.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for c in content.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

fn write_node<W: Write>(writer: &mut W, node: &ConversationNode) -> io::Result<()> {
    match node.role {
        Role::User => writeln!(writer, "## User")?,
        Role::Assistant => writeln!(writer, "## Assistant")?,
        Role::Tool => writeln!(
            writer,
            "### Tool: {}",
            node.tool_name.as_deref().unwrap_or("tool")
        )?,
    }
    writeln!(writer)?;
    if let Some(ts) = node.timestamp {
        writeln!(writer, "*{}*", ts.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(writer)?;
    }
    if node.orphaned {
        writeln!(writer, "> Replies to a message that is no longer stored.")?;
        writeln!(writer)?;
    }
    if node.cycle_broken {
        writeln!(writer, "> Detached from a reply loop.")?;
        writeln!(writer)?;
    }

    let content = node.content.trim_end();
    if node.role == Role::Tool {
        let fence = fence_for(content);
        writeln!(writer, "{}", fence)?;
        writeln!(writer, "{}", content)?;
        writeln!(writer, "{}", fence)?;
    } else if !content.is_empty() {
        writeln!(writer, "{}", content)?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Write one conversation as Markdown.
pub fn render_conversation<W: Write>(
    writer: &mut W,
    tree: &ConversationTree,
    ctx: &RenderContext<'_>,
) -> io::Result<()> {
    let fm = Frontmatter {
        id: &tree.id,
        title: ctx.title,
        kind: tree.schema_kind,
        created_at: tree.created_at,
        updated_at: tree.updated_at,
        scopes: ctx.scopes,
        folders: ctx.folders,
    };

    writeln!(writer, "---")?;
    let yaml = serde_yaml::to_string(&fm).map_err(io::Error::other)?;
    write!(writer, "{}", yaml)?;
    writeln!(writer, "---")?;
    writeln!(writer)?;
    writeln!(writer, "# {}", ctx.title)?;
    writeln!(writer)?;

    // Depth-first; sibling replies are labelled as branches.
    let mut stack: Vec<(&ConversationNode, Option<(usize, usize)>)> = vec![(&tree.root, None)];
    while let Some((node, branch)) = stack.pop() {
        if let Some((k, n)) = branch {
            writeln!(writer, "> Branch {} of {}", k, n)?;
            writeln!(writer)?;
        }
        write_node(writer, node)?;

        let replies = node.children.iter().filter(|c| c.role != Role::Tool).count();
        let mut k = replies;
        for child in node.children.iter().rev() {
            let label = if child.role != Role::Tool && replies > 1 {
                let label = Some((k, replies));
                k -= 1;
                label
            } else {
                None
            };
            stack.push((child, label));
        }
    }
    Ok(())
}

fn allocate_filename(id: &str, title: &str, registry: &mut HashMap<String, String>) -> String {
    let raw_slug = slug::slugify(title);
    // slug output is ASCII-only, so byte == char
    let slug = raw_slug[..raw_slug.len().min(60)]
        .trim_end_matches('-')
        .to_string();
    let named = |prefix: &str| {
        if slug.is_empty() {
            prefix.to_string()
        } else {
            format!("{}_{}", prefix, slug)
        }
    };

    for len in [8usize, 12, id.len()] {
        let candidate = id.get(..len.min(id.len())).unwrap_or(id);
        match registry.get(candidate) {
            None => {
                registry.insert(candidate.to_string(), id.to_string());
                return named(candidate);
            }
            Some(existing) if existing == id => return named(candidate),
            Some(_) => continue,
        }
    }
    named(id)
}

/// Build an in-memory index of existing .md files: prefix → full path.
/// The prefix is the portion of the filename before the first '_' (or before '.md' if no '_').
fn build_file_index(target_dir: &Path) -> HashMap<String, PathBuf> {
    let mut map = HashMap::new();
    let Ok(entries) = fs::read_dir(target_dir) else {
        return map;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let Some(stem) = name_str.strip_suffix(".md") else {
            continue;
        };
        let prefix = stem.split('_').next().unwrap_or(stem);
        if !prefix.is_empty() {
            map.insert(prefix.to_string(), entry.path());
        }
    }
    map
}

struct MarkdownExport<'a> {
    target_dir: &'a Path,
    force: bool,
    registry: HashMap<String, String>,
    file_index: HashMap<String, PathBuf>,
}

impl MarkdownExport<'_> {
    fn export(&mut self, tree: &ConversationTree, ctx: &RenderContext<'_>) -> Result<ProcessResult> {
        let stem = allocate_filename(&tree.id, ctx.title, &mut self.registry);
        let prefix = stem.split('_').next().unwrap_or(&stem).to_string();
        let desired_path = self.target_dir.join(format!("{}.md", stem));

        // Only a file that records this conversation's id is treated as ours.
        let existing_path = self.file_index.get(&prefix).cloned().filter(|p| {
            parse_existing_frontmatter(p).is_some_and(|fm| fm.id.as_deref() == Some(&tree.id))
        });

        if !self.force
            && let Some(existing) = &existing_path
            && let Some(fm) = parse_existing_frontmatter(existing)
            && let (Some(on_disk), Some(current)) = (fm.updated_at, tree.updated_at)
            && on_disk >= current
        {
            debug!(file = %existing.display(), "up to date");
            return Ok(ProcessResult::Skipped);
        }

        let result = if existing_path.is_none() {
            ProcessResult::Created
        } else {
            ProcessResult::Updated
        };

        // Title changed since the last export.
        if let Some(existing) = &existing_path
            && existing != &desired_path
            && let Err(e) = fs::rename(existing, &desired_path)
        {
            warn!(
                from = %existing.display(),
                to = %desired_path.display(),
                "could not rename: {}",
                e
            );
        }
        self.file_index.insert(prefix, desired_path.clone());

        let file = File::create(&desired_path)
            .wrap_err_with(|| format!("Failed to create: {}", desired_path.display()))?;
        let mut writer = BufWriter::new(file);
        render_conversation(&mut writer, tree, ctx)
            .wrap_err_with(|| format!("Failed to write markdown: {}", desired_path.display()))?;
        writer.flush().wrap_err("Failed to flush markdown file")?;

        debug!(file = %desired_path.display(), ?result, "written");
        Ok(result)
    }
}

/// Render every conversation of an extraction into `target_dir`.
pub fn write_markdown(extraction: &Extraction, target_dir: &Path, force: bool) -> Result<RenderCounts> {
    fs::create_dir_all(target_dir).wrap_err_with(|| {
        format!("Failed to create target directory: {}", target_dir.display())
    })?;

    let mut export = MarkdownExport {
        target_dir,
        force,
        registry: HashMap::new(),
        file_index: build_file_index(target_dir),
    };
    let mut counts = RenderCounts::default();

    for tree in &extraction.conversations {
        let merged = extraction.merged.get(&tree.id);
        let draft = merged.and_then(|m| m.canonical_payload.draft_text.as_deref());
        let title = display_title(tree, draft);
        let scopes: Vec<String> = merged
            .map(|m| m.source_scopes.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        let folders = extraction.folders_of(&tree.id);
        let ctx = RenderContext {
            title: &title,
            scopes: &scopes,
            folders: &folders,
        };

        match export.export(tree, &ctx) {
            Ok(ProcessResult::Created) => counts.created += 1,
            Ok(ProcessResult::Updated) => counts.updated += 1,
            Ok(ProcessResult::Skipped) => counts.skipped += 1,
            Err(e) => {
                counts.errors += 1;
                warn!(conversation = %tree.id, "{:#}", e);
            }
        }
    }
    Ok(counts)
}
