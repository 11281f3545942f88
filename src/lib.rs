//! # qapilot
//!
//! Self-hosted orchestrator for autonomous test-automation agents.
//!
//! An execution pairs an agent type with a goal. The orchestrator drives it
//! through a run loop: the agent's planner names the next tool call, the
//! tool runs, its outcome is appended to the audit log, and the loop repeats
//! until the planner is done, a budget is exhausted, a reviewer rejects the
//! work, or someone stops it.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API ──► Orchestrator ──► run loop (one task per execution)
//!                    │               │  plan ─► budget ─► tool ─► append
//!                    │               ▼
//!                    │         ExecutionStore (guarded writes)
//!                    │               ▲
//!   decisions ──► resume handler ────┤
//!                 approval timers ───┘
//! ```
//!
//! ## Modules
//! - `agents`: pure planners, one per agent type
//! - `execution`: goals, execution rows, the action audit log
//! - `budget`: iteration and cost ceilings
//! - `tools`: the tool contract, registry and built-in adapters
//! - `approval`: tickets and decision events
//! - `store`: execution persistence (memory or SQLite)
//! - `orchestrator`: start/status/cancel, run loop, resume protocol
//! - `llm`: chat-completion client used by the AI tool
//! - `api`: HTTP surface

pub mod agents;
pub mod api;
pub mod approval;
pub mod budget;
pub mod config;
pub mod execution;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod tools;

pub use config::Config;
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
