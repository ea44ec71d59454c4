//! # Deep Research
//!
//! Orchestration engine for multi-step company research.
//!
//! For each subject the engine runs three steps against one research
//! provider, persisting each step's output as it goes, then renders the
//! compiled report and publishes it to an external endpoint with an HMAC
//! signature.
//!
//! ```text
//!   HTTP API ──▶ Supervisor ──▶ Step executors ──▶ ResearchProvider (A | B | C)
//!                   │  ▲
//!                   ▼  │
//!               TaskStore (SQLite)      Renderer ──▶ Publisher ──▶ endpoint
//! ```
//!
//! ## Modules
//! - `research`: task records, the store, step executors, the supervisor
//! - `llm`: provider adapters with shared retry and error taxonomy
//! - `publish`: signed publishing and tracking URLs
//! - `render`: markdown to displayable report variants
//! - `subjects`: subject records and their store
//! - `budget`: per-model cost estimates
//! - `api`: HTTP control surface

pub mod api;
pub mod budget;
pub mod config;
pub mod llm;
pub mod publish;
pub mod render;
pub mod research;
pub mod subjects;

pub use config::Config;
pub use research::Supervisor;
