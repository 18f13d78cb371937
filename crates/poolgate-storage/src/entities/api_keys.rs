use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "group_key_hash")]
    pub group_id: i64,
    /// Encrypted at rest; decrypted only at selection time.
    pub key_value: String,
    /// Stable fingerprint of the plaintext, for dedup and lookup.
    #[sea_orm(unique_key = "group_key_hash")]
    pub key_hash: String,
    /// "active" or "invalid".
    pub status: String,
    pub failure_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "group_id", to = "id", on_delete = "Cascade")]
    pub group: HasOne<super::groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
