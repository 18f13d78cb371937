use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use poolgate_common::{GlobalConfig, GlobalConfigPatch};
use poolgate_core::{
    AppState, Cipher, GroupManager, HubSelector, KeyProvider, ProxyExecutor, UpstreamClient,
    UpstreamClientConfig, WeightEngine, WreqUpstreamClient,
};
use poolgate_storage::{LogSinkConfig, RequestLogSink, SeaOrmStorage, Storage};
use poolgate_store::{MemoryStore, RedisStore, SharedStore};

#[derive(Debug, Parser)]
#[command(name = "poolgate", about = "Multi-tenant key-pool reverse proxy for LLM APIs")]
pub struct Cli {
    #[arg(long, env = "POOLGATE_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "POOLGATE_PORT")]
    pub port: Option<u16>,
    /// Database DSN (sqlite/mysql/postgres).
    #[arg(long, env = "POOLGATE_DSN", default_value = "sqlite://poolgate.db?mode=rwc")]
    pub dsn: String,
    /// Shared store URL; omit for the in-process store.
    #[arg(long, env = "POOLGATE_STORE_URL")]
    pub store_url: Option<String>,
    /// Master key protecting credentials at rest.
    #[arg(long, env = "POOLGATE_MASTER_KEY")]
    pub master_key: String,
    /// Comma-separated tokens accepted on every group's proxy endpoint.
    #[arg(long, env = "POOLGATE_GLOBAL_PROXY_KEYS")]
    pub global_proxy_keys: Option<String>,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "POOLGATE_PROXY")]
    pub proxy: Option<String>,
}

impl Cli {
    fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: Some(self.dsn),
            store_url: self.store_url,
            master_key: Some(self.master_key),
            global_proxy_keys: self.global_proxy_keys.map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            proxy: self.proxy,
        }
    }
}

pub struct Bootstrapped {
    pub global: GlobalConfig,
    pub state: Arc<AppState>,
    pub executor: Arc<ProxyExecutor>,
    pub selector: Arc<HubSelector>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn bootstrap() -> Result<Bootstrapped> {
    let mut patch = GlobalConfigPatch::default();
    patch.overlay(Cli::parse().into_patch());
    let global = patch.into_config().context("invalid configuration")?;

    let storage = SeaOrmStorage::connect(&global.dsn)
        .await
        .with_context(|| format!("connect database {}", global.dsn))?;
    storage.sync().await.context("schema sync")?;
    let storage: Arc<dyn Storage> = Arc::new(storage);

    let settings = match storage.load_system_settings().await? {
        Some(settings) => settings,
        None => {
            let defaults = poolgate_common::SystemSettings::default();
            storage.upsert_system_settings(&defaults).await?;
            defaults
        }
    };

    let store: SharedStore = match &global.store_url {
        Some(url) => {
            let redis = RedisStore::connect(url)
                .await
                .with_context(|| format!("connect store {url}"))?;
            tracing::info!(%url, "using shared store");
            Arc::new(redis)
        }
        None => {
            tracing::info!("using in-process store");
            Arc::new(MemoryStore::new())
        }
    };

    let cipher = Arc::new(Cipher::new(&global.master_key));
    let manager = GroupManager::load(storage.clone(), store.clone(), &cipher, settings.clone())
        .await
        .context("load group catalog")?;

    let keys = KeyProvider::new(store.clone(), storage.clone(), cipher.clone());
    let group_ids: Vec<_> = manager.snapshot().by_id.keys().copied().collect();
    for group_id in group_ids {
        keys.load_group_keys(group_id)
            .await
            .with_context(|| format!("load keys for group {group_id}"))?;
    }

    let client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::from_settings(
            &settings,
            global.proxy.clone(),
        ))
        .map_err(|err| anyhow::anyhow!("upstream client: {}", err.message))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (log_sink, _sink_handle) =
        RequestLogSink::spawn(storage.clone(), LogSinkConfig::default(), shutdown_rx.clone());

    let state = Arc::new(AppState::new(
        global.clone(),
        store.clone(),
        storage,
        cipher,
        manager,
        keys,
        WeightEngine::new(store),
        client,
        log_sink,
    ));

    let executor = Arc::new(ProxyExecutor::new(state.clone()));
    let selector = Arc::new(HubSelector::new(state.clone()));

    tokio::spawn(poolgate_core::loops::weight_decay_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(poolgate_core::loops::invalidation_subscriber(
        state.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(poolgate_core::validation_sweep(state.clone(), shutdown_rx));

    Ok(Bootstrapped {
        global,
        state,
        executor,
        selector,
        shutdown: shutdown_tx,
    })
}
