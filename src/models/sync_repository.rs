//! SyncRepository entity model
//!
//! Read-side view of the repositories the ledger wants mirrored.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use crate::types::{ParseEnumError, SourceKind};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_repositories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub repo_id: i64,
    /// Stable operator-facing key, e.g. `gitlab.example.com/group/project`
    #[sea_orm(unique)]
    pub repo_key: String,
    pub source_kind: String,
    pub gitlab_instance: Option<String>,
    pub tenant_id: Option<String>,
    pub enabled: bool,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn source_kind(&self) -> Result<SourceKind, ParseEnumError> {
        self.source_kind.parse()
    }
}
