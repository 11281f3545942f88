//! HTTP API for qapilot.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check, default budget and registered tools
//! - `POST /api/executions` - Start an execution
//! - `GET /api/executions` - List executions (`?limit&offset`)
//! - `GET /api/executions/{id}` - Execution status and counters
//! - `GET /api/executions/{id}/actions` - Audit log
//! - `POST /api/executions/{id}/cancel` - Cooperative stop
//! - `GET /api/approvals` - Pending approval tickets
//! - `GET /api/approvals/{ticket_id}` - One ticket
//! - `POST /api/approvals/{ticket_id}/decision` - Approve or reject

mod routes;
pub mod types;

pub use routes::{build_state, router, serve, AppState};
pub use types::*;
