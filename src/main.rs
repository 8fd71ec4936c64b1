use clap::Parser;
use cursor_chat_export::exporter::{Export, write_export_file};
use cursor_chat_export::pipeline::{ExtractOptions, extract};
use cursor_chat_export::renderer::write_markdown;
use cursor_chat_export::scanner::{OpenMode, default_storage_root, discover_scopes};
use cursor_chat_export::utils::ExportConfig;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Export Cursor AI chat and composer history to JSON and Markdown.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file to write.
    /// Defaults to ./cursor-chats.json if not set in config.
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Cursor's `User` directory (holding globalStorage/ and workspaceStorage/).
    /// Auto-detected if omitted.
    #[arg(long, value_name = "PATH")]
    storage_root: Option<PathBuf>,

    /// Also write one Markdown file per conversation into this directory.
    #[arg(long, value_name = "DIR")]
    markdown: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/cursor-chat-export/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read from backup copies of the stores instead of the live files.
    #[arg(long)]
    snapshot: bool,

    /// Rewrite Markdown files even if they are up to date.
    #[arg(short, long)]
    force: bool,

    /// Log every scope, skipped record and merge conflict.
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings; no summary.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    storage_root: Option<PathBuf>,
    output: Option<PathBuf>,
    markdown_dir: Option<PathBuf>,
    snapshot: Option<bool>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("cursor-chat-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(config: &ExportConfig) -> Result<()> {
    let scopes = discover_scopes(&config.storage_root);
    info!(root = %config.storage_root.display(), scopes = scopes.len(), "discovered stores");

    let options = ExtractOptions {
        mode: if config.snapshot {
            OpenMode::Snapshot
        } else {
            OpenMode::Direct
        },
        ..Default::default()
    };
    let extraction = extract(&scopes, &options).wrap_err_with(|| {
        format!("Extraction failed under {}", config.storage_root.display())
    })?;

    let export = Export {
        conversations: extraction.conversations.clone(),
    };
    write_export_file(&config.output, &export)?;
    info!(file = %config.output.display(), "wrote JSON export");

    let rendered = match &config.markdown_dir {
        Some(dir) => Some(write_markdown(&extraction, dir, config.force)?),
        None => None,
    };

    if !config.quiet {
        let s = &extraction.summary;
        let mut line = format!(
            "Done. {} conversations from {} stores ({} unavailable), {} records skipped.",
            s.conversations_produced, s.scopes_scanned, s.scopes_failed, s.records_skipped
        );
        if let Some(counts) = rendered {
            line.push_str(&format!(
                " Markdown: {} created, {} updated, {} skipped.",
                counts.created, counts.updated, counts.skipped
            ));
            if counts.errors > 0 {
                line.push_str(&format!(" Completed with {} error(s).", counts.errors));
            }
        }
        if s.truncated {
            line.push_str(" Stopped early; results are partial.");
        }
        eprintln!("{}", line);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve storage root (CLI > Config > Auto-detect)
    let storage_root = cli
        .storage_root
        .or(file_cfg.storage_root)
        .or_else(default_storage_root)
        .ok_or_else(|| {
            eyre!("Could not determine Cursor's storage directory.\nUse --storage-root to specify it manually, or set storage_root in config.toml.")
        })?;

    if !storage_root.is_dir() {
        return Err(eyre!(
            "Cursor storage not found at: {}\nUse --storage-root to specify the path manually.",
            storage_root.display()
        ));
    }

    // 3. Resolve outputs (CLI > Config > Default)
    let output = cli
        .output
        .or(file_cfg.output)
        .unwrap_or_else(|| PathBuf::from("cursor-chats.json"));
    let markdown_dir = cli.markdown.or(file_cfg.markdown_dir);

    let config = ExportConfig {
        storage_root,
        output,
        markdown_dir,
        snapshot: cli.snapshot || file_cfg.snapshot.unwrap_or(false),
        force: cli.force,
        quiet: cli.quiet,
    };

    run(&config)
}
