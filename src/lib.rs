//! Background automation core for a kanban project manager.
//!
//! ## Overview
//!
//! Two cooperating subsystems keep local kanban boards fresh without user
//! intervention. The index refresh scheduler keeps a per-repository file
//! index up to date (debounced, coalesced, cancelable), and the remote
//! reconciliation engine mirrors GitHub/GitLab issues, pull requests, and
//! board drafts into local cards and pushes local status moves back out.
//! Every unit of background work is recorded as a job row that ends in
//! exactly one terminal state.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────────┐  requests   ┌────────────────────────────────────────────┐
//! │ CLI / serve │ ──────────> │  scheduler.rs (IndexScheduler, coalescing) │
//! │    loop     │             │      │ IndexBuilder::build_index()         │
//! └─────────────┘             │      v                                     │
//!        │                    │  indexer.rs (FileIndexBuilder, CancelToken)│
//!        │ process_job()      │  watcher.rs (MtimeWatcher -> fswatch runs) │
//!        v                    └────────────────────────────────────────────┘
//! ┌────────────────────────────────────────────┐
//! │  sync/mod.rs (SyncEngine)                  │
//! │      │ RemoteAdapter (per provider)        │
//! │      v                                     │
//! │  sync/github.rs   sync/gitlab.rs           │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | Shared types: `Project`, `Card`, `Job`, status enums    |
//! | `db`        | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `config`    | Per-project sync policy (labels, Projects V2 board)     |
//! | `errors`    | `IndexError` / `SyncError` hierarchies                  |
//! | `broadcast` | Payload-free state-changed fan-out for observers        |
//! | `workspace` | `.boardsync` workspace probing and creation             |

pub mod broadcast;
pub mod config;
pub mod db;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod scheduler;
pub mod sync;
pub mod watcher;
pub mod workspace;
