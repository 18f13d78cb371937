#![allow(clippy::needless_update)]

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, ExprTrait, QueryFilter, QueryOrder, Schema,
};
use time::OffsetDateTime;

use poolgate_common::{GroupId, KeyId, SystemSettings};

use crate::entities;
use crate::storage::{
    ApiKeyRow, CatalogSnapshot, GroupInsert, GroupRow, HourlyStatDelta, HubAccessKeyRow,
    InsertKeysOutcome, KeyStatus, NewApiKey, RequestLogInsert, Storage, StorageResult, SubGroupRow,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Sqlite needs this for cascade deletes to fire.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn group_row(model: entities::groups::Model) -> GroupRow {
    GroupRow {
        id: model.id,
        name: model.name,
        display_name: model.display_name,
        enabled: model.enabled,
        group_type: model.group_type,
        channel_type: model.channel_type,
        upstreams: model.upstreams,
        test_model: model.test_model,
        validation_endpoint: model.validation_endpoint,
        param_overrides: model.param_overrides,
        config_json: model.config_json,
        header_rules: model.header_rules,
        path_redirects: model.path_redirects,
        model_redirect_map: model.model_redirect_map,
        model_redirect_strict: model.model_redirect_strict,
        proxy_keys: model.proxy_keys,
        model_group_priority: model.model_group_priority,
        weight: model.weight,
        custom_models: model.custom_models,
        cc_support: model.cc_support,
        sort: model.sort,
        parent_group_id: model.parent_group_id,
        bound_site_id: model.bound_site_id,
        updated_at: model.updated_at,
    }
}

fn api_key_row(model: entities::api_keys::Model) -> ApiKeyRow {
    ApiKeyRow {
        id: model.id,
        group_id: model.group_id,
        key_value: model.key_value,
        key_hash: model.key_hash,
        status: KeyStatus::parse(&model.status).unwrap_or(KeyStatus::Invalid),
        failure_count: model.failure_count,
        last_used_at: model.last_used_at,
        notes: model.notes,
    }
}

fn hub_key_row(model: entities::hub_access_keys::Model) -> HubAccessKeyRow {
    let allowed_models = model
        .allowed_models
        .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok());
    HubAccessKeyRow {
        id: model.id,
        name: model.name,
        key_value: model.key_value,
        key_hash: model.key_hash,
        allowed_models,
        enabled: model.enabled,
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::SystemSettings)
            .register(entities::Groups)
            .register(entities::ApiKeys)
            .register(entities::GroupSubGroups)
            .register(entities::HubAccessKeys)
            .register(entities::RequestLogs)
            .register(entities::GroupHourlyStats)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_system_settings(&self) -> StorageResult<Option<SystemSettings>> {
        use entities::system_settings::Column;
        let row = entities::SystemSettings::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        match row {
            Some(model) => Ok(Some(serde_json::from_value(model.config_json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_system_settings(&self, settings: &SystemSettings) -> StorageResult<()> {
        use entities::system_settings::Column;
        let active = entities::system_settings::ActiveModel {
            id: ActiveValue::Set(1),
            config_json: ActiveValue::Set(serde_json::to_value(settings)?),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::SystemSettings::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::ConfigJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_catalog(&self) -> StorageResult<CatalogSnapshot> {
        let groups = entities::Groups::find()
            .order_by_asc(entities::groups::Column::Sort)
            .all(&self.db)
            .await?;
        let sub_groups = entities::GroupSubGroups::find().all(&self.db).await?;
        let hub_keys = entities::HubAccessKeys::find().all(&self.db).await?;

        Ok(CatalogSnapshot {
            groups: groups.into_iter().map(group_row).collect(),
            sub_groups: sub_groups
                .into_iter()
                .map(|m| SubGroupRow {
                    group_id: m.group_id,
                    sub_group_id: m.sub_group_id,
                    weight: m.weight,
                })
                .collect(),
            hub_access_keys: hub_keys.into_iter().map(hub_key_row).collect(),
        })
    }

    async fn load_group_keys(&self, group_id: GroupId) -> StorageResult<Vec<ApiKeyRow>> {
        use entities::api_keys::Column;
        let rows = entities::ApiKeys::find()
            .filter(Column::GroupId.eq(group_id))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(api_key_row).collect())
    }

    async fn set_key_status(
        &self,
        key_id: KeyId,
        status: KeyStatus,
        failure_count: i64,
    ) -> StorageResult<()> {
        use entities::api_keys::Column;
        entities::ApiKeys::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()).into())
            .col_expr(Column::FailureCount, Expr::value(failure_count).into())
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()).into())
            .filter(Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_group_key_statuses(
        &self,
        group_id: GroupId,
        from: KeyStatus,
        to: KeyStatus,
    ) -> StorageResult<u64> {
        use entities::api_keys::Column;
        let result = entities::ApiKeys::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()).into())
            .col_expr(Column::FailureCount, Expr::value(0i64).into())
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()).into())
            .filter(Column::GroupId.eq(group_id))
            .filter(Column::Status.eq(from.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn touch_key_used(&self, key_id: KeyId) -> StorageResult<()> {
        use entities::api_keys::Column;
        entities::ApiKeys::update_many()
            .col_expr(Column::LastUsedAt, Expr::value(OffsetDateTime::now_utc()).into())
            .filter(Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_keys(
        &self,
        group_id: GroupId,
        keys: &[NewApiKey],
    ) -> StorageResult<InsertKeysOutcome> {
        use entities::api_keys::Column;
        if keys.is_empty() {
            return Ok(InsertKeysOutcome::default());
        }

        let now = OffsetDateTime::now_utc();
        let models = keys.iter().map(|key| entities::api_keys::ActiveModel {
            id: ActiveValue::NotSet,
            group_id: ActiveValue::Set(group_id),
            key_value: ActiveValue::Set(key.key_value.clone()),
            key_hash: ActiveValue::Set(key.key_hash.clone()),
            status: ActiveValue::Set(KeyStatus::Active.as_str().to_string()),
            failure_count: ActiveValue::Set(0),
            last_used_at: ActiveValue::Set(None),
            notes: ActiveValue::Set(key.notes.clone()),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        });

        let added = entities::ApiKeys::insert_many(models)
            .on_conflict(
                OnConflict::columns([Column::GroupId, Column::KeyHash])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(InsertKeysOutcome {
            added,
            duplicates: keys.len() as u64 - added,
        })
    }

    async fn delete_group_keys(
        &self,
        group_id: GroupId,
        status: Option<KeyStatus>,
    ) -> StorageResult<u64> {
        use entities::api_keys::Column;
        let mut query = entities::ApiKeys::delete_many().filter(Column::GroupId.eq(group_id));
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        let result = query.exec(&self.db).await?;
        Ok(result.rows_affected)
    }

    async fn group_name_exists(&self, name: &str) -> StorageResult<bool> {
        use entities::groups::Column;
        let found = entities::Groups::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;
        Ok(found.is_some())
    }

    async fn insert_group(&self, group: GroupInsert) -> StorageResult<GroupId> {
        let now = OffsetDateTime::now_utc();
        let active = entities::groups::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(group.name),
            display_name: ActiveValue::Set(group.display_name),
            enabled: ActiveValue::Set(group.enabled),
            group_type: ActiveValue::Set(group.group_type),
            channel_type: ActiveValue::Set(group.channel_type),
            upstreams: ActiveValue::Set(group.upstreams),
            test_model: ActiveValue::Set(group.test_model),
            validation_endpoint: ActiveValue::Set(group.validation_endpoint),
            param_overrides: ActiveValue::Set(group.param_overrides),
            config_json: ActiveValue::Set(group.config_json),
            header_rules: ActiveValue::Set(group.header_rules),
            path_redirects: ActiveValue::Set(group.path_redirects),
            model_redirect_map: ActiveValue::Set(group.model_redirect_map),
            model_redirect_strict: ActiveValue::Set(group.model_redirect_strict),
            proxy_keys: ActiveValue::Set(group.proxy_keys),
            model_group_priority: ActiveValue::Set(group.model_group_priority),
            weight: ActiveValue::Set(group.weight),
            custom_models: ActiveValue::Set(group.custom_models),
            cc_support: ActiveValue::Set(group.cc_support),
            sort: ActiveValue::Set(group.sort),
            parent_group_id: ActiveValue::Set(None),
            bound_site_id: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let result = entities::Groups::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    async fn insert_sub_groups(
        &self,
        group_id: GroupId,
        members: &[(GroupId, i64)],
    ) -> StorageResult<()> {
        use entities::group_sub_groups::Column;
        if members.is_empty() {
            return Ok(());
        }
        let models = members
            .iter()
            .map(|(sub_group_id, weight)| entities::group_sub_groups::ActiveModel {
                id: ActiveValue::NotSet,
                group_id: ActiveValue::Set(group_id),
                sub_group_id: ActiveValue::Set(*sub_group_id),
                weight: ActiveValue::Set(*weight),
                ..Default::default()
            });
        entities::GroupSubGroups::insert_many(models)
            .on_conflict(
                OnConflict::columns([Column::GroupId, Column::SubGroupId])
                    .update_columns([Column::Weight])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn find_group_id_by_name(&self, name: &str) -> StorageResult<Option<GroupId>> {
        use entities::groups::Column;
        let found = entities::Groups::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;
        Ok(found.map(|m| m.id))
    }

    async fn append_request_logs(&self, rows: &[RequestLogInsert]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let models = rows.iter().map(|row| entities::request_logs::ActiveModel {
            id: ActiveValue::NotSet,
            at: ActiveValue::Set(row.at),
            group_id: ActiveValue::Set(row.group_id),
            key_id: ActiveValue::Set(row.key_id),
            request_type: ActiveValue::Set(row.request_type.to_string()),
            attempt: ActiveValue::Set(row.attempt),
            success: ActiveValue::Set(row.success),
            status_code: ActiveValue::Set(row.status_code),
            latency_ms: ActiveValue::Set(row.latency_ms),
            model: ActiveValue::Set(row.model.clone()),
            upstream_url: ActiveValue::Set(row.upstream_url.clone()),
            error_class: ActiveValue::Set(row.error_class.map(str::to_string)),
            error_message: ActiveValue::Set(row.error_message.clone()),
        });
        entities::RequestLogs::insert_many(models)
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn add_hourly_stats(&self, rows: &[HourlyStatDelta]) -> StorageResult<()> {
        use entities::group_hourly_stats::Column;
        for row in rows {
            let active = entities::group_hourly_stats::ActiveModel {
                id: ActiveValue::NotSet,
                group_id: ActiveValue::Set(row.group_id),
                hour: ActiveValue::Set(row.hour),
                success_count: ActiveValue::Set(row.success_count),
                failure_count: ActiveValue::Set(row.failure_count),
                prompt_tokens: ActiveValue::Set(row.prompt_tokens),
                completion_tokens: ActiveValue::Set(row.completion_tokens),
            };
            entities::GroupHourlyStats::insert(active)
                .on_conflict(
                    OnConflict::columns([Column::GroupId, Column::Hour])
                        .values([
                            (
                                Column::SuccessCount,
                                Expr::col(Column::SuccessCount)
                                    .add(row.success_count)
                                    .into(),
                            ),
                            (
                                Column::FailureCount,
                                Expr::col(Column::FailureCount)
                                    .add(row.failure_count)
                                    .into(),
                            ),
                            (
                                Column::PromptTokens,
                                Expr::col(Column::PromptTokens).add(row.prompt_tokens).into(),
                            ),
                            (
                                Column::CompletionTokens,
                                Expr::col(Column::CompletionTokens)
                                    .add(row.completion_tokens)
                                    .into(),
                            ),
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await?;
        }
        Ok(())
    }
}
