//! SQLite-based approval store.

use super::{ApprovalStore, ApprovalTicket, DecisionEvent, TicketStatus};
use crate::execution::now_string;
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS approval_tickets (
    id TEXT PRIMARY KEY NOT NULL,
    execution_id TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    reviewer TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    decided_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tickets_status ON approval_tickets(status, created_at);
CREATE INDEX IF NOT EXISTS idx_tickets_execution ON approval_tickets(execution_id);
"#;

const TICKET_COLUMNS: &str =
    "id, execution_id, content, metadata, status, reviewer, notes, created_at, decided_at";

pub struct SqliteApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteApprovalStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        let db_path = base_dir.join("approvals.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create approval store dir: {}", e))?;

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn parse_status(s: &str) -> TicketStatus {
    match s {
        "approved" => TicketStatus::Approved,
        "rejected" => TicketStatus::Rejected,
        "expired" => TicketStatus::Expired,
        _ => TicketStatus::Pending,
    }
}

fn status_to_string(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Pending => "pending",
        TicketStatus::Approved => "approved",
        TicketStatus::Rejected => "rejected",
        TicketStatus::Expired => "expired",
    }
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<ApprovalTicket> {
    let execution_id: String = row.get(1)?;
    let metadata: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(ApprovalTicket {
        id: row.get(0)?,
        execution_id: Uuid::parse_str(&execution_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
        })?,
        content: row.get(2)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
        })?,
        status: parse_status(&status),
        reviewer: row.get(5)?,
        notes: row.get(6)?,
        created_at: row.get(7)?,
        decided_at: row.get(8)?,
    })
}

fn load_ticket(conn: &Connection, ticket_id: &str) -> Result<Option<ApprovalTicket>, String> {
    conn.query_row(
        &format!("SELECT {} FROM approval_tickets WHERE id = ?1", TICKET_COLUMNS),
        params![ticket_id],
        row_to_ticket,
    )
    .optional()
    .map_err(|e| e.to_string())
}

#[async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn create_ticket(
        &self,
        execution_id: Uuid,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<String, String> {
        let conn = self.conn.clone();
        let id = format!("apr-{}", Uuid::new_v4().simple());
        let content = content.to_string();
        let metadata = serde_json::to_string(&metadata).map_err(|e| e.to_string())?;
        let ticket_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                &format!(
                    "INSERT INTO approval_tickets ({}) VALUES (?1, ?2, ?3, ?4, 'pending', NULL, NULL, ?5, NULL)",
                    TICKET_COLUMNS
                ),
                params![ticket_id, execution_id.to_string(), content, metadata, now_string()],
            )
            .map_err(|e| format!("Failed to create ticket: {}", e))
        })
        .await
        .map_err(|e| e.to_string())??;
        Ok(id)
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<ApprovalTicket>, String> {
        let conn = self.conn.clone();
        let ticket_id = ticket_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            load_ticket(&conn, &ticket_id)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalTicket>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approval_tickets WHERE status = 'pending' ORDER BY created_at",
                    TICKET_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt.query_map([], row_to_ticket).map_err(|e| e.to_string())?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn record_decision(&self, decision: &DecisionEvent) -> Result<ApprovalTicket, String> {
        let conn = self.conn.clone();
        let decision = decision.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let ticket = load_ticket(&conn, &decision.ticket_id)?
                .ok_or_else(|| format!("Ticket {} not found", decision.ticket_id))?;

            let wanted = decision.status();
            match ticket.status {
                TicketStatus::Pending => {
                    let changed = conn
                        .execute(
                            "UPDATE approval_tickets
                             SET status = ?1, reviewer = ?2, notes = ?3, decided_at = ?4
                             WHERE id = ?5 AND status = 'pending'",
                            params![
                                status_to_string(wanted),
                                decision.reviewer,
                                decision.notes,
                                now_string(),
                                decision.ticket_id
                            ],
                        )
                        .map_err(|e| e.to_string())?;
                    if changed == 0 {
                        return Err(format!("Ticket {} changed concurrently", ticket.id));
                    }
                    load_ticket(&conn, &decision.ticket_id)?
                        .ok_or_else(|| format!("Ticket {} vanished", decision.ticket_id))
                }
                current if current == wanted => Ok(ticket),
                TicketStatus::Expired => Err(format!("Ticket {} has expired", ticket.id)),
                _ => Err(format!(
                    "Ticket {} was already {:?}",
                    ticket.id, ticket.status
                )),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn expire(&self, ticket_id: &str) -> Result<(), String> {
        let conn = self.conn.clone();
        let ticket_id = ticket_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE approval_tickets SET status = 'expired', decided_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_string(), ticket_id],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
