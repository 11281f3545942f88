//! In-memory approval store (non-persistent).

use super::{ApprovalStore, ApprovalTicket, DecisionEvent, TicketStatus};
use crate::execution::now_string;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct InMemoryApprovalStore {
    tickets: Arc<RwLock<HashMap<String, ApprovalTicket>>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create_ticket(
        &self,
        execution_id: Uuid,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, String> {
        let ticket = ApprovalTicket {
            id: format!("apr-{}", Uuid::new_v4().simple()),
            execution_id,
            content: content.to_string(),
            metadata,
            status: TicketStatus::Pending,
            reviewer: None,
            notes: None,
            created_at: now_string(),
            decided_at: None,
        };
        let id = ticket.id.clone();
        self.tickets.write().await.insert(id.clone(), ticket);
        Ok(id)
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<ApprovalTicket>, String> {
        Ok(self.tickets.read().await.get(ticket_id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalTicket>, String> {
        let mut tickets: Vec<ApprovalTicket> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|t| t.status == TicketStatus::Pending)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tickets)
    }

    async fn record_decision(&self, decision: &DecisionEvent) -> Result<ApprovalTicket, String> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .get_mut(&decision.ticket_id)
            .ok_or_else(|| format!("Ticket {} not found", decision.ticket_id))?;

        let wanted = decision.status();
        match ticket.status {
            TicketStatus::Pending => {
                ticket.status = wanted;
                ticket.reviewer = Some(decision.reviewer.clone());
                ticket.notes = decision.notes.clone();
                ticket.decided_at = Some(now_string());
                Ok(ticket.clone())
            }
            current if current == wanted => Ok(ticket.clone()),
            TicketStatus::Expired => Err(format!("Ticket {} has expired", ticket.id)),
            _ => Err(format!(
                "Ticket {} was already {:?}",
                ticket.id, ticket.status
            )),
        }
    }

    async fn expire(&self, ticket_id: &str) -> Result<(), String> {
        if let Some(ticket) = self.tickets.write().await.get_mut(ticket_id) {
            if ticket.status == TicketStatus::Pending {
                ticket.status = TicketStatus::Expired;
                ticket.decided_at = Some(now_string());
            }
        }
        Ok(())
    }
}
