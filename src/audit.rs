// 📜 Audit Trail - every mutation is an event
//
// Append-only. The ledger writes here inside the same transaction as the
// change it describes; nothing in the core reads it back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::db::{self, opt_json_col, parsed_col};
use crate::error::Result;

/// Actor recorded when the caller does not name one
pub const SYSTEM_ACTOR: &str = "ledger";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    /// create / update / confirm / confirm_batch / void / delete / lock / ...
    pub action: String,
    pub changed_fields: Option<Value>,
    pub actor: Option<String>,
}

impl AuditEvent {
    pub fn new(entity_type: &str, entity_id: &str, action: &str, changed_fields: Option<Value>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: db::utc_now(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            changed_fields,
            actor: Some(SYSTEM_ACTOR.to_string()),
        }
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        if let Some(actor) = actor {
            self.actor = Some(actor.to_string());
        }
        self
    }
}

// ============================================================================
// FIELD CHANGES (patch operations record each field as from/to)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

impl FieldChange {
    pub fn new(field: &str, from: impl Serialize, to: impl Serialize) -> Self {
        FieldChange {
            field: field.to_string(),
            from: json!(from),
            to: json!(to),
        }
    }
}

/// `{"field": {"from": .., "to": ..}, ...}`
pub fn changes_to_json(changes: &[FieldChange]) -> Value {
    let mut map = Map::new();
    for change in changes {
        map.insert(
            change.field.clone(),
            json!({ "from": change.from, "to": change.to }),
        );
    }
    Value::Object(map)
}

// ============================================================================
// STORAGE
// ============================================================================

pub fn insert_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    let changed_json = event
        .changed_fields
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO audit_log (
            event_id, timestamp, entity_type, entity_id, action, changed_fields, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            db::timestamp(&event.timestamp),
            event.entity_type,
            event.entity_id,
            event.action,
            changed_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Shorthand used by the ledger modules
pub(crate) fn record(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    action: &str,
    changed_fields: Option<Value>,
) -> Result<()> {
    insert_event(conn, &AuditEvent::new(entity_type, entity_id, action, changed_fields))
}

/// Events for one entity, oldest first
pub fn events_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, entity_type, entity_id, action, changed_fields, actor
         FROM audit_log
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok(AuditEvent {
                event_id: row.get(0)?,
                timestamp: parsed_col(row, 1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                action: row.get(4)?,
                changed_fields: opt_json_col(row, 5)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}
