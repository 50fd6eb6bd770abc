//! Process-wide session state.
//!
//! Built once at startup from configuration and shared read-only by every
//! request and every client connection: datasource configs, their pools, the
//! executor defaults and the tool registry. Per-request state lives in the
//! request's own task.

use crate::config::ServerConfig;
use crate::db::{Connector, Pool, PoolManager, QueryExecutor, SqlxConnector};
use crate::error::{DbError, DbResult};
use crate::models::DatasourceConfig;
use crate::sql::SqlDialect;
use crate::tools::ToolRegistry;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A configured datasource together with its pool.
pub struct Datasource<'a, C: Connector> {
    pub config: &'a DatasourceConfig,
    pub pool: &'a Arc<Pool<C>>,
}

impl<C: Connector> Datasource<'_, C> {
    pub fn dialect(&self) -> SqlDialect {
        SqlDialect::new(self.config.engine)
    }
}

pub struct SessionState<C: Connector = SqlxConnector> {
    /// Ordered by id so listings are stable
    configs: BTreeMap<String, DatasourceConfig>,
    pools: PoolManager<C>,
    executor: QueryExecutor,
    registry: ToolRegistry,
}

impl SessionState<SqlxConnector> {
    /// Build the session for the configured datasources.
    ///
    /// No connection is opened here; see [`SessionState::warm_up`].
    pub fn from_config(config: &ServerConfig) -> DbResult<Self> {
        let registry = ToolRegistry::new(&config.disabled_tools)?;
        let mut session = Self::new(registry, QueryExecutor::new(config.limits));
        for datasource in &config.datasources {
            let connector = SqlxConnector::new(datasource, config.connect_timeout);
            session.add_datasource(datasource.clone(), connector)?;
        }
        Ok(session)
    }
}

impl<C: Connector> SessionState<C> {
    pub fn new(registry: ToolRegistry, executor: QueryExecutor) -> Self {
        Self {
            configs: BTreeMap::new(),
            pools: PoolManager::new(),
            executor,
            registry,
        }
    }

    pub fn add_datasource(&mut self, config: DatasourceConfig, connector: C) -> DbResult<()> {
        if self.configs.contains_key(&config.id) {
            return Err(DbError::config(format!(
                "Duplicate datasource id '{}'",
                config.id
            )));
        }
        info!(
            datasource = %config.id,
            engine = %config.engine,
            policy = %config.policy,
            url = %config.masked_connection_string(),
            max_connections = config.pool.max_connections,
            "Datasource configured"
        );
        self.pools.insert(Pool::new(&config.id, connector, config.pool));
        self.configs.insert(config.id.clone(), config);
        Ok(())
    }

    pub fn datasource(&self, id: &str) -> DbResult<Datasource<'_, C>> {
        let config = self
            .configs
            .get(id)
            .ok_or_else(|| DbError::datasource_not_found(id))?;
        Ok(Datasource {
            config,
            pool: self.pools.get(id)?,
        })
    }

    pub fn datasources(&self) -> impl Iterator<Item = Datasource<'_, C>> {
        self.configs.values().filter_map(|config| {
            self.pools
                .get(&config.id)
                .ok()
                .map(|pool| Datasource { config, pool })
        })
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run a tool call against this session.
    pub async fn dispatch(&self, tool: &str, arguments: JsonValue) -> DbResult<JsonValue> {
        self.registry.dispatch(tool, arguments, self).await
    }

    /// Pre-open each pool's minimum connections. Failures are logged only.
    pub async fn warm_up(&self) {
        self.pools.warm_up_all().await;
    }

    /// Close every pool, giving outstanding leases up to `grace` to return.
    pub async fn shutdown(&self, grace: Duration) {
        info!(datasources = self.pools.len(), "Closing datasource pools");
        self.pools.shutdown_all(grace).await;
    }
}
