use sea_orm::entity::prelude::*;

/// Weighted fan-in relation from an aggregate group to its standard members.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "group_sub_groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "group_sub_group")]
    pub group_id: i64,
    #[sea_orm(unique_key = "group_sub_group")]
    pub sub_group_id: i64,
    pub weight: i64,
    #[sea_orm(belongs_to, from = "group_id", to = "id", on_delete = "Cascade")]
    pub group: HasOne<super::groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
