use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "group_hourly_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "group_hour")]
    pub group_id: i64,
    /// Hour bucket, truncated to :00:00.
    #[sea_orm(unique_key = "group_hour")]
    pub hour: OffsetDateTime,
    pub success_count: i64,
    pub failure_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl ActiveModelBehavior for ActiveModel {}
