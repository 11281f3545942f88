//! Approval tickets - the external human-in-the-loop checkpoint.
//!
//! A `REQUEST_APPROVAL` action creates a ticket here. Reviewers decide on it
//! (through the HTTP API or any other collaborator) and the decision is
//! published to the orchestrator as a [`DecisionEvent`]. The ticket store never
//! touches execution state; the resume handler owns that transition.

mod memory;
mod sqlite;

pub use memory::InMemoryApprovalStore;
pub use sqlite::SqliteApprovalStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

use crate::store::StoreType;

/// Lifecycle of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl TicketStatus {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub id: String,
    pub execution_id: Uuid,
    /// What the reviewer is asked to approve (generated test, patch, ...)
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
}

/// A reviewer's verdict, delivered at-least-once to the resume handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub ticket_id: String,
    pub approved: bool,
    pub reviewer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl DecisionEvent {
    fn status(&self) -> TicketStatus {
        if self.approved {
            TicketStatus::Approved
        } else {
            TicketStatus::Rejected
        }
    }
}

/// Approval store trait - implemented by ticket backends.
///
/// # Invariants
/// - A ticket is decided at most once; re-recording the same verdict is a
///   no-op, a conflicting verdict is an error
/// - An expired ticket accepts no decision
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Open a ticket for an execution; returns its id.
    async fn create_ticket(
        &self,
        execution_id: Uuid,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, String>;

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<ApprovalTicket>, String>;

    /// Undecided tickets, oldest first.
    async fn list_pending(&self) -> Result<Vec<ApprovalTicket>, String>;

    /// Commit a decision on the ticket.
    ///
    /// Returns the ticket as stored after the call.
    async fn record_decision(&self, decision: &DecisionEvent) -> Result<ApprovalTicket, String>;

    /// Mark a still-pending ticket expired. No-op for decided tickets.
    async fn expire(&self, ticket_id: &str) -> Result<(), String>;
}

/// Create an approval store on the same backend as the execution store.
pub async fn create_approval_store(
    store_type: StoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn ApprovalStore>, String> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryApprovalStore::new())),
        StoreType::Sqlite => Ok(Box::new(SqliteApprovalStore::new(base_dir).await?)),
    }
}
