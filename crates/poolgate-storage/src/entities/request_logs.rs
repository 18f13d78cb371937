use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub at: OffsetDateTime,
    pub group_id: Option<i64>,
    pub key_id: Option<i64>,
    /// "final" or "retry". Only final rows count for rate aggregation.
    pub request_type: String,
    pub attempt: i32,
    pub success: bool,
    pub status_code: Option<i32>,
    pub latency_ms: i64,
    pub model: Option<String>,
    pub upstream_url: Option<String>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
