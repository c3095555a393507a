//! # Novel Catalog
//!
//! Watches directories of novels, splits each file into a table of chapters,
//! and serves chapter text on demand.
//!
//! The catalog stores chapter *positions* (line ranges into plain text, or
//! item ids inside an EPUB) rather than chapter text. Text is re-derived
//! from the live file whenever a chapter is read.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │   Watcher    │──▶│  Reconciler  │──▶│ Segmenters │──▶│  SQLite  │
//! │ notify + walk│   │ sync/move/rm │   │ text, EPUB │   │ positions│
//! └──────────────┘   └──────────────┘   └────────────┘   └────┬─────┘
//!                                                             │
//!                     ┌───────────────────────────────────────┤
//!                     ▼                                       ▼
//!               ┌──────────┐    resolve(position)       ┌──────────┐
//!               │   CLI    │◀──── live source file ────▶│   HTTP   │
//!               │ (novels) │                            │  (axum)  │
//!               └──────────┘                            └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! novels init                   # create database
//! novels scan                   # reconcile the library once
//! novels search "snow"          # find novels by title or author
//! novels serve                  # watch the library and serve the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`patterns`] | Chapter heading rules |
//! | [`segment_text`] | Plain-text segmentation into line ranges |
//! | [`epub`] | EPUB container parsing |
//! | [`segment_epub`] | EPUB segmentation and XHTML cleaning |
//! | [`segment`] | Per-file segmentation entry point |
//! | [`resolve`] | Chapter text retrieval from positions |
//! | [`store`] | Catalog storage abstraction |
//! | [`sqlite_store`] | SQLite catalog backend |
//! | [`reconcile`] | Filesystem-to-catalog reconciliation |
//! | [`watcher`] | Live filesystem watching |
//! | [`catalog`] | Read path shared by CLI and server |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod db;
pub mod epub;
pub mod error;
pub mod migrate;
pub mod models;
pub mod patterns;
pub mod reconcile;
pub mod resolve;
pub mod segment;
pub mod segment_epub;
pub mod segment_text;
pub mod server;
pub mod sqlite_store;
pub mod store;
pub mod watcher;
