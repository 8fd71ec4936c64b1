//! # cursor-chat-export
//!
//! Recovers the AI chat history that [Cursor](https://cursor.com) keeps in its
//! local SQLite state files and writes it out as JSON (and optionally Markdown).
//!
//! ## What it does
//!
//! Cursor stores conversations as JSON blobs inside VS Code style key-value
//! stores: one global `state.vscdb` plus one per workspace. The same
//! conversation often appears in several of them, in different historical
//! layouts. This crate
//!
//! 1. scans every store for conversation keys ([`scanner`]),
//! 2. decodes each value into a normalized record ([`decoder`], [`schema`]),
//! 3. reconciles records of the same conversation across stores ([`merger`]),
//! 4. builds a branching message tree per conversation ([`tree`]),
//!
//! and hands the result to the [`exporter`] and [`renderer`].
//!
//! The stores are opened **read-only**. With `--snapshot` each store is first
//! copied through the SQLite backup API and only the copy is read.
//!
//! ## Usage
//!
//! ```sh
//! # Export everything found under the default Cursor directory
//! cursor-chat-export cursor-chats.json
//!
//! # Also write one Markdown file per conversation
//! cursor-chat-export cursor-chats.json --markdown ~/notes/cursor
//! ```
//!
//! Preferences can be persisted in `~/.config/cursor-chat-export/config.toml`.
//!
//! ## Compatibility
//!
//! Cursor's storage layout is undocumented and changes between releases; the
//! alias tables in [`schema`] cover the layouts seen so far.

pub mod decoder;
pub mod exporter;
pub mod merger;
pub mod model;
pub mod pipeline;
pub mod renderer;
pub mod scanner;
pub mod schema;
pub mod tree;
pub mod utils;
