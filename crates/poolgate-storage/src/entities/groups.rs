use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "group_name")]
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    /// "standard" or "aggregate".
    pub group_type: String,
    pub channel_type: String,
    /// `[{"url": "...", "weight": 1}, ...]`
    pub upstreams: Json,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub param_overrides: Json,
    /// Per-group override patch of the system settings.
    pub config_json: Json,
    pub header_rules: Json,
    pub path_redirects: Json,
    pub model_redirect_map: Json,
    pub model_redirect_strict: bool,
    /// Tokens granting access to this group's proxy endpoint.
    pub proxy_keys: Json,
    /// Lower value sorts into an earlier hub tier.
    pub model_group_priority: i32,
    /// Base weight for hub weighted-random selection.
    pub weight: i32,
    /// Extra models an aggregate group advertises to the hub.
    pub custom_models: Json,
    /// Whether Claude-format traffic may land on this group when the channel
    /// is not anthropic.
    pub cc_support: bool,
    pub sort: i32,
    pub parent_group_id: Option<i64>,
    pub bound_site_id: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub api_keys: HasMany<super::api_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
