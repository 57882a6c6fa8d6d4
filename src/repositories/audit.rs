//! # Admin Audit Repository

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryOrder, QuerySelect,
    Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::admin_audit::{ActiveModel, Column, Entity as AdminAudit, Model};

#[derive(Debug, Clone)]
pub struct AuditRepository {
    db: Arc<DatabaseConnection>,
}

impl AuditRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        action: &str,
        actor: &str,
        target: JsonValue,
        detail: Option<JsonValue>,
    ) -> EngineResult<Model> {
        Self::record_in(self.db.as_ref(), action, actor, target, detail, Utc::now()).await
    }

    pub async fn record_in<C>(
        conn: &C,
        action: &str,
        actor: &str,
        target: JsonValue,
        detail: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> EngineResult<Model>
    where
        C: ConnectionTrait,
    {
        ActiveModel {
            audit_id: Set(Uuid::new_v4()),
            action: Set(action.to_string()),
            actor: Set(actor.to_string()),
            target: Set(target),
            detail: Set(detail),
            created_at: Set(to_db_time(now)),
        }
        .insert(conn)
        .await
        .map_err(db_err("failed to record admin audit"))
    }

    /// Most recent entries first.
    pub async fn list_recent(&self, limit: u64) -> EngineResult<Vec<Model>> {
        AdminAudit::find()
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list admin audit"))
    }
}
