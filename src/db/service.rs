//! The SQL service facade.
//!
//! A [`SqlService`] runs statements on behalf of a unit of work. The first
//! statement in a [`Transaction`] leases a connection (from the service's own
//! pool or from a registered data source), registers a
//! [`SqlTransactionMember`] holding it and fires the begin hook. Later
//! statements in the same transaction reuse that connection and the
//! transaction's [`StatementCache`]. Commit, rollback and release are driven
//! by the transaction.

use crate::config::{DEFAULT_POOL_SWEEP_INTERVAL_SECS, SqlServiceConfig};
use crate::db::backend::SqlxConnector;
use crate::db::binds::FunctionArg;
use crate::db::connection::{Connection, Connector, DataSourceRegistry, PreparedStatement};
use crate::db::functions::{
    AccessControl, BindFunctionResolver, BindFunctions, DescriptorIndex, TextProvider,
};
use crate::db::member::{MemberOwner, SqlTransactionMember};
use crate::db::pool::{ConnectionPool, PoolConfig, PoolOwner};
use crate::db::processor::{BoundStatement, SelectStreamHandler, StatementProcessor};
use crate::db::statement_cache::{STATEMENT_CACHE_MEMBER_ID, StatementCache};
use crate::db::style::{SqlStyle, style_for};
use crate::db::transaction::Transaction;
use crate::error::{SqlError, SqlResult};
use crate::models::{BindBase, Row, Value};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Overridable behavior of a SQL service. Every hook has a default.
#[async_trait]
pub trait SqlServiceHooks: Send + Sync {
    /// Initialize a freshly created pooled connection.
    async fn after_connection_created(&self, _conn: &Arc<dyn Connection>) -> SqlResult<()> {
        Ok(())
    }

    /// Check an idle pooled connection before reuse.
    async fn test_connection(&self, style: &dyn SqlStyle, conn: &Arc<dyn Connection>) -> SqlResult<()> {
        style.test_connection(conn).await
    }

    /// Called once per transaction after the connection was leased.
    async fn begin_transaction(&self, _conn: &Arc<dyn Connection>) -> SqlResult<()> {
        Ok(())
    }

    /// Called before the physical commit or rollback.
    async fn end_transaction(
        &self,
        _conn: &Arc<dyn Connection>,
        _will_be_committed: bool,
    ) -> SqlResult<()> {
        Ok(())
    }

    /// Resolve a custom bind function. `None` falls back to the built-in
    /// `level`, `code` and `text` functions.
    fn custom_bind_function(
        &self,
        _name: &str,
        _args: &[FunctionArg],
        _bases: &[BindBase],
    ) -> Option<SqlResult<Value>> {
        None
    }
}

/// Hooks with only the default behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl SqlServiceHooks for DefaultHooks {}

enum ConnectionSource {
    Pool(Arc<ConnectionPool>),
    DataSource {
        registry: DataSourceRegistry,
        name: String,
        prefixes: Vec<String>,
    },
}

struct ServiceInner {
    name: String,
    member_id: String,
    config: SqlServiceConfig,
    style: Arc<dyn SqlStyle>,
    source: ConnectionSource,
    hooks: Arc<dyn SqlServiceHooks>,
    functions: BindFunctions,
}

impl ServiceInner {
    fn acquisition_context(&self) -> String {
        match &self.source {
            ConnectionSource::Pool(_) => format!(
                "jdbcDriverName={}, jdbcMappingName={}",
                self.config.driver_name_or_default(),
                self.config.masked_mapping_name()
            ),
            ConnectionSource::DataSource { name, .. } => format!("jndiName={}", name),
        }
    }

    async fn lease_connection(&self) -> SqlResult<Arc<dyn Connection>> {
        let result = match &self.source {
            ConnectionSource::Pool(pool) => pool.lease_connection(self).await,
            // Data source connections are pooled by the data source and not initialized here.
            ConnectionSource::DataSource {
                registry,
                name,
                prefixes,
            } => match registry.lookup(name, prefixes) {
                Some((found, source)) => {
                    debug!(service = %self.name, data_source = %found, "Opening data source connection");
                    source.connect().await
                }
                None => Err(SqlError::connection(format!(
                    "Cannot find data source '{}'",
                    name
                ))),
            },
        };
        result.map_err(|e| e.with_context(self.acquisition_context()))
    }
}

#[async_trait]
impl PoolOwner for ServiceInner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self, conn: &Arc<dyn Connection>) -> SqlResult<()> {
        self.hooks.test_connection(self.style.as_ref(), conn).await
    }

    async fn after_connection_created(&self, conn: &Arc<dyn Connection>) -> SqlResult<()> {
        self.hooks.after_connection_created(conn).await
    }
}

#[async_trait]
impl MemberOwner for ServiceInner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn end_transaction(
        &self,
        conn: &Arc<dyn Connection>,
        will_be_committed: bool,
    ) -> SqlResult<()> {
        self.hooks.end_transaction(conn, will_be_committed).await
    }

    async fn release_connection(&self, conn: Arc<dyn Connection>) {
        match &self.source {
            ConnectionSource::Pool(pool) => pool.release_connection(&conn).await,
            ConnectionSource::DataSource { name, .. } => {
                if let Err(e) = conn.close().await {
                    error!(
                        service = %self.name,
                        jndi_name = %name,
                        connection_id = conn.id(),
                        error = %e,
                        "Failed to close data source connection"
                    );
                }
            }
        }
    }
}

impl BindFunctionResolver for ServiceInner {
    fn resolve(&self, name: &str, args: &[FunctionArg], bases: &[BindBase]) -> SqlResult<Value> {
        self.hooks
            .custom_bind_function(name, args, bases)
            .unwrap_or_else(|| self.functions.resolve(name, args, bases))
    }
}

/// Configures and creates a [`SqlService`].
pub struct SqlServiceBuilder {
    config: SqlServiceConfig,
    connector: Option<Arc<dyn Connector>>,
    data_sources: Option<DataSourceRegistry>,
    style: Option<Arc<dyn SqlStyle>>,
    hooks: Arc<dyn SqlServiceHooks>,
    descriptors: DescriptorIndex,
    access_control: Option<Arc<dyn AccessControl>>,
    text_provider: Option<Arc<dyn TextProvider>>,
    sweep_interval: Option<Duration>,
}

impl SqlServiceBuilder {
    /// Connector for the service pool. Defaults to a sqlx connector for the mapping name.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Registry the JNDI name is looked up in when `direct_jdbc_connection` is false.
    pub fn data_sources(mut self, registry: DataSourceRegistry) -> Self {
        self.data_sources = Some(registry);
        self
    }

    pub fn style(mut self, style: Arc<dyn SqlStyle>) -> Self {
        self.style = Some(style);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SqlServiceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Permissions and codes known to `::level` and `::code`.
    pub fn descriptors(mut self, descriptors: DescriptorIndex) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn access_control(mut self, access_control: Arc<dyn AccessControl>) -> Self {
        self.access_control = Some(access_control);
        self
    }

    pub fn text_provider(mut self, text_provider: Arc<dyn TextProvider>) -> Self {
        self.text_provider = Some(text_provider);
        self
    }

    /// Interval of the idle connection sweep; `None` disables it.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> SqlResult<SqlService> {
        let config = self.config;
        config.validate().map_err(SqlError::configuration)?;

        let name = config.name_or_default().to_string();
        let style = match self.style {
            Some(style) => style,
            None => style_for(config.sql_style.as_deref(), config.database_type())?,
        };

        let source = if config.direct_jdbc_connection_or_default() {
            let connector: Arc<dyn Connector> = match self.connector {
                Some(connector) => connector,
                None => Arc::new(SqlxConnector::from_config(&config)?),
            };
            let pool = ConnectionPool::new(PoolConfig::from_service_config(&config), connector);
            if let Some(interval) = self.sweep_interval {
                if tokio::runtime::Handle::try_current().is_ok() {
                    pool.start_sweeper(interval);
                } else {
                    warn!(service = %name, "No async runtime, idle connection sweep disabled");
                }
            }
            ConnectionSource::Pool(pool)
        } else {
            let registry = self.data_sources.ok_or_else(|| {
                SqlError::configuration("A data source registry is required for JNDI connections")
            })?;
            ConnectionSource::DataSource {
                registry,
                name: config.jndi_name.clone().unwrap_or_default(),
                prefixes: config.jndi_url_pkg_prefixes_list(),
            }
        };

        let mut functions = BindFunctions::new(self.descriptors);
        if let Some(access_control) = self.access_control {
            functions = functions.with_access_control(access_control);
        }
        if let Some(text_provider) = self.text_provider {
            functions = functions.with_text_provider(text_provider);
        }

        info!(
            service = %name,
            style = style.name(),
            direct = config.direct_jdbc_connection_or_default(),
            pool_size = config.pool_size_or_default(),
            "SQL service initialized"
        );

        Ok(SqlService {
            inner: Arc::new(ServiceInner {
                member_id: config.transaction_member_id_or_default(),
                name,
                config,
                style,
                source,
                hooks: self.hooks,
                functions,
            }),
        })
    }
}

/// Transactional SQL service. Cheap to clone.
#[derive(Clone)]
pub struct SqlService {
    inner: Arc<ServiceInner>,
}

impl SqlService {
    pub fn builder(config: SqlServiceConfig) -> SqlServiceBuilder {
        SqlServiceBuilder {
            config,
            connector: None,
            data_sources: None,
            style: None,
            hooks: Arc::new(DefaultHooks),
            descriptors: DescriptorIndex::new(),
            access_control: None,
            text_provider: None,
            sweep_interval: Some(Duration::from_secs(DEFAULT_POOL_SWEEP_INTERVAL_SECS)),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Id under which this service's member registers with a transaction.
    pub fn transaction_member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn config(&self) -> &SqlServiceConfig {
        &self.inner.config
    }

    pub fn style(&self) -> &Arc<dyn SqlStyle> {
        &self.inner.style
    }

    /// The service pool, when connections are leased directly.
    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        match &self.inner.source {
            ConnectionSource::Pool(pool) => Some(pool),
            ConnectionSource::DataSource { .. } => None,
        }
    }

    /// Pool report, when connections are leased directly.
    pub fn inventory(&self) -> Option<String> {
        self.pool().map(|pool| pool.inventory())
    }

    /// This service's member in `tx`, if it has one.
    pub fn member(&self, tx: &Transaction) -> Option<Arc<SqlTransactionMember>> {
        tx.member_as::<SqlTransactionMember>(&self.inner.member_id)
    }

    fn check_active(tx: &Transaction) -> SqlResult<()> {
        if tx.is_cancelled() {
            Err(SqlError::cancelled(tx.id()))
        } else {
            Ok(())
        }
    }

    /// The connection of this service in `tx`, leasing one on first use.
    pub async fn connection(&self, tx: &Transaction) -> SqlResult<Arc<dyn Connection>> {
        Self::check_active(tx)?;
        if let Some(member) = self.member(tx) {
            return Ok(member.connection());
        }
        if tx.member(&self.inner.member_id).is_some() {
            return Err(SqlError::internal(format!(
                "Transaction member id '{}' is taken by another member type",
                self.inner.member_id
            )));
        }

        let conn = self.inner.lease_connection().await?;
        let owner: Arc<dyn MemberOwner> = self.inner.clone();
        let member = Arc::new(SqlTransactionMember::new(
            self.inner.member_id.clone(),
            conn.clone(),
            owner,
        ));
        if let Err(e) = tx.register_member(member) {
            self.inner.release_connection(conn).await;
            // A concurrent call in the same transaction registered first.
            return match self.member(tx) {
                Some(existing) => Ok(existing.connection()),
                None => Err(e),
            };
        }
        debug!(
            service = %self.inner.name,
            transaction_id = %tx.id(),
            connection_id = conn.id(),
            "Transaction member started"
        );
        self.inner.hooks.begin_transaction(&conn).await?;
        Ok(conn)
    }

    /// The statement cache of `tx`, created and registered on first use.
    pub fn statement_cache(&self, tx: &Transaction) -> SqlResult<Arc<StatementCache>> {
        Self::check_active(tx)?;
        if let Some(cache) = tx.member_as::<StatementCache>(STATEMENT_CACHE_MEMBER_ID) {
            return Ok(cache);
        }
        let cache = Arc::new(StatementCache::new(
            self.inner.config.statement_cache_size_or_default(),
        ));
        match tx.register_member(cache.clone()) {
            Ok(()) => Ok(cache),
            Err(e) => tx
                .member_as::<StatementCache>(STATEMENT_CACHE_MEMBER_ID)
                .ok_or(e),
        }
    }

    fn processor(&self) -> StatementProcessor<'_> {
        StatementProcessor::new(self.inner.style.as_ref(), self.inner.as_ref())
            .with_max_fetch_memory_size(self.inner.config.max_fetch_memory_size_or_default())
    }

    /// Bind `sql` and fetch its prepared statement for the transaction's connection.
    async fn prepare(
        &self,
        tx: &Transaction,
        sql: &str,
        bases: &[BindBase],
    ) -> SqlResult<(BoundStatement, Arc<dyn PreparedStatement>, String)> {
        let bound = self.processor().bind(sql, bases)?;
        let cache = self.statement_cache(tx)?;
        let conn = self.connection(tx).await?;
        let identity = format!("service={}, connectionId={}", self.inner.name, conn.id());
        let statement = cache
            .get_or_create(&conn, &bound.sql)
            .await
            .map_err(|e| e.with_context(format!("statement={}", bound.sql)).with_context(identity.clone()))?;
        Ok((bound, statement, identity))
    }

    async fn select_rows(
        &self,
        tx: &Transaction,
        sql: &str,
        max_rows: Option<usize>,
        bases: &[BindBase],
    ) -> SqlResult<Vec<Row>> {
        let (bound, statement, identity) = self.prepare(tx, sql, bases).await?;
        self.processor()
            .select(statement.as_ref(), &bound, max_rows)
            .await
            .map_err(|e| e.with_context(identity))
    }

    pub async fn select(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<Vec<Row>> {
        self.select_rows(tx, sql, None, bases).await
    }

    /// Like [`select`](Self::select), returning at most `max_rows` rows (0 means no limit).
    pub async fn select_limited(
        &self,
        tx: &Transaction,
        sql: &str,
        max_rows: usize,
        bases: &[BindBase],
    ) -> SqlResult<Vec<Row>> {
        self.select_rows(tx, sql, Some(max_rows), bases).await
    }

    async fn select_into_rows(
        &self,
        tx: &Transaction,
        sql: &str,
        max_rows: Option<usize>,
        bases: &[BindBase],
    ) -> SqlResult<()> {
        let (bound, statement, identity) = self.prepare(tx, sql, bases).await?;
        self.processor()
            .select_into(statement.as_ref(), &bound, max_rows)
            .await
            .map(|_| ())
            .map_err(|e| e.with_context(identity))
    }

    /// Run a select and write the columns into the `INTO` output binds.
    pub async fn select_into(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<()> {
        self.select_into_rows(tx, sql, None, bases).await
    }

    pub async fn select_into_limited(
        &self,
        tx: &Transaction,
        sql: &str,
        max_rows: usize,
        bases: &[BindBase],
    ) -> SqlResult<()> {
        self.select_into_rows(tx, sql, Some(max_rows), bases).await
    }

    async fn select_streaming_rows(
        &self,
        tx: &Transaction,
        sql: &str,
        handler: &mut dyn SelectStreamHandler,
        max_rows: Option<usize>,
        bases: &[BindBase],
    ) -> SqlResult<u64> {
        let (bound, statement, identity) = self.prepare(tx, sql, bases).await?;
        self.processor()
            .select_streaming(statement.as_ref(), &bound, handler, max_rows)
            .await
            .map_err(|e| e.with_context(identity))
    }

    /// Run a select, handing each row to `handler` as it is read.
    pub async fn select_streaming(
        &self,
        tx: &Transaction,
        sql: &str,
        handler: &mut dyn SelectStreamHandler,
        bases: &[BindBase],
    ) -> SqlResult<u64> {
        self.select_streaming_rows(tx, sql, handler, None, bases).await
    }

    pub async fn select_streaming_limited(
        &self,
        tx: &Transaction,
        sql: &str,
        handler: &mut dyn SelectStreamHandler,
        max_rows: usize,
        bases: &[BindBase],
    ) -> SqlResult<u64> {
        self.select_streaming_rows(tx, sql, handler, Some(max_rows), bases)
            .await
    }

    async fn modify(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<u64> {
        let (bound, statement, identity) = self.prepare(tx, sql, bases).await?;
        self.processor()
            .modify(statement.as_ref(), &bound)
            .await
            .map_err(|e| e.with_context(identity))
    }

    pub async fn insert(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<u64> {
        self.modify(tx, sql, bases).await
    }

    pub async fn update(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<u64> {
        self.modify(tx, sql, bases).await
    }

    pub async fn delete(&self, tx: &Transaction, sql: &str, bases: &[BindBase]) -> SqlResult<u64> {
        self.modify(tx, sql, bases).await
    }

    /// Call a stored procedure. Returns `true` if it produced a result set.
    pub async fn call_stored_procedure(
        &self,
        tx: &Transaction,
        sql: &str,
        bases: &[BindBase],
    ) -> SqlResult<bool> {
        let (bound, statement, identity) = self.prepare(tx, sql, bases).await?;
        self.processor()
            .call_stored_procedure(statement.as_ref(), &bound)
            .await
            .map_err(|e| e.with_context(identity))
    }

    /// Commit the connection of this service in `tx` immediately.
    pub async fn commit(&self, tx: &Transaction) -> SqlResult<()> {
        let conn = self.connection(tx).await?;
        conn.commit().await.map_err(|e| {
            e.with_context(format!("service={}, connectionId={}", self.inner.name, conn.id()))
        })?;
        self.inner.style.commit();
        Ok(())
    }

    /// Roll back the connection of this service in `tx` immediately.
    pub async fn rollback(&self, tx: &Transaction) -> SqlResult<()> {
        let conn = self.connection(tx).await?;
        conn.rollback().await.map_err(|e| {
            e.with_context(format!("service={}, connectionId={}", self.inner.name, conn.id()))
        })?;
        self.inner.style.rollback();
        Ok(())
    }

    /// Render `sql` with all binds inlined as literals. Nothing is executed.
    pub fn create_plain_text(&self, sql: &str, bases: &[BindBase]) -> SqlResult<String> {
        self.processor().plain_text(sql, bases)
    }

    /// Next value of a database sequence; 0 when the query returns no single row.
    pub async fn sequence_next_value(&self, tx: &Transaction, sequence: &str) -> SqlResult<i64> {
        let valid = !sequence.is_empty()
            && sequence
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'));
        if !valid {
            return Err(SqlError::illegal_argument(format!(
                "Invalid sequence name '{}'",
                sequence
            )));
        }
        let sql = self
            .inner
            .style
            .sequence_next_value_sql(sequence)
            .ok_or_else(|| {
                SqlError::processing(format!(
                    "SQL style '{}' has no sequences",
                    self.inner.style.name()
                ))
            })?;
        let rows = self.select(tx, &sql, &[]).await?;
        Ok(match rows.as_slice() {
            [row] => row.first().and_then(Value::as_i64).unwrap_or(0),
            _ => 0,
        })
    }

    /// Stop the sweeper and close idle pooled connections.
    pub async fn close(&self) {
        if let Some(pool) = self.pool() {
            pool.close().await;
        }
    }
}

impl std::fmt::Debug for SqlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlService")
            .field("name", &self.inner.name)
            .field("member_id", &self.inner.member_id)
            .field("style", &self.inner.style.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::functions::{Descriptor, ID_FIELD};
    use crate::db::member::MemberState;
    use crate::db::mock::MockConnector;
    use std::sync::Mutex;

    fn config() -> SqlServiceConfig {
        SqlServiceConfig {
            name: Some("orders".to_string()),
            jdbc_driver_name: Some("mock".to_string()),
            pool_size: Some(2),
            ..SqlServiceConfig::for_mapping_name("mock:orders")
        }
    }

    fn service(connector: &MockConnector) -> SqlService {
        SqlService::builder(config())
            .connector(Arc::new(connector.clone()))
            .sweep_interval(None)
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SqlServiceHooks for RecordingHooks {
        async fn after_connection_created(&self, conn: &Arc<dyn Connection>) -> SqlResult<()> {
            self.events.lock().unwrap().push(format!("created:{}", conn.id()));
            Ok(())
        }

        async fn begin_transaction(&self, _conn: &Arc<dyn Connection>) -> SqlResult<()> {
            self.events.lock().unwrap().push("begin".to_string());
            Ok(())
        }

        async fn end_transaction(
            &self,
            _conn: &Arc<dyn Connection>,
            will_be_committed: bool,
        ) -> SqlResult<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("end:{}", will_be_committed));
            Ok(())
        }

        fn custom_bind_function(
            &self,
            name: &str,
            _args: &[FunctionArg],
            _bases: &[BindBase],
        ) -> Option<SqlResult<Value>> {
            (name == "tenant").then(|| Ok(Value::Int(42)))
        }
    }

    #[test]
    fn test_defaults() {
        let service = service(&MockConnector::new());
        assert_eq!(service.name(), "orders");
        assert_eq!(service.transaction_member_id(), "orders.transaction");
        assert_eq!(service.style().name(), "oracle");
        assert!(service.pool().is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SqlService::builder(SqlServiceConfig {
            pool_size: Some(0),
            ..config()
        })
        .connector(Arc::new(MockConnector::new()))
        .build();
        assert!(matches!(result, Err(SqlError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_one_connection_per_transaction() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let tx = Transaction::new();

        let first = service.connection(&tx).await.unwrap();
        let second = service.connection(&tx).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.state().log().connects, 1);
        assert_eq!(service.member(&tx).unwrap().state(), MemberState::Active);
    }

    #[tokio::test]
    async fn test_statement_cache_shared_within_transaction() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let tx = Transaction::new();

        let a = service.statement_cache(&tx).unwrap();
        let b = service.statement_cache(&tx).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        service.select(&tx, "SELECT 1 FROM DUAL", &[]).await.unwrap();
        service.select(&tx, "SELECT  1 FROM DUAL", &[]).await.unwrap();
        assert_eq!(connector.state().log().prepared.len(), 1);

        tx.finish(true).await.unwrap();
        assert!(a.is_released());
        assert_eq!(connector.state().log().closed_statements.len(), 1);
    }

    #[tokio::test]
    async fn test_hook_order_and_commit() {
        let connector = MockConnector::new();
        let hooks = Arc::new(RecordingHooks::default());
        let service = SqlService::builder(config())
            .connector(Arc::new(connector.clone()))
            .hooks(hooks.clone())
            .sweep_interval(None)
            .build()
            .unwrap();

        let tx = Transaction::new();
        let affected = service
            .update(&tx, "UPDATE orders SET tenant = ::tenant()", &[])
            .await
            .unwrap();
        assert_eq!(affected, 1);
        let conn_id = service.connection(&tx).await.unwrap().id();
        tx.finish(true).await.unwrap();

        assert_eq!(
            *hooks.events.lock().unwrap(),
            vec![format!("created:{}", conn_id), "begin".into(), "end:true".into()]
        );
        let log = connector.state().log();
        assert_eq!(log.commits, 1);
        assert_eq!(log.executed[0].1, vec![Value::Int(42)]);
        assert_eq!(service.pool().unwrap().stats().idle, 1);
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_rolls_back() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let tx = Transaction::new();
        service
            .insert(&tx, "INSERT INTO orders (id) VALUES (:id)", &[BindBase::pair("id", 1_i64)])
            .await
            .unwrap();
        tx.finish(false).await.unwrap();

        let log = connector.state().log();
        assert_eq!(log.commits, 0);
        assert_eq!(log.rollbacks, 1);
        assert_eq!(service.pool().unwrap().stats().leased, 0);
    }

    #[tokio::test]
    async fn test_lease_failure_carries_context() {
        let connector = MockConnector::new();
        connector.state().fail_connect(true);
        let service = service(&connector);
        let tx = Transaction::new();

        let err = service.select(&tx, "SELECT 1 FROM DUAL", &[]).await.unwrap_err();
        assert!(err.is_acquisition_failure());
        assert!(
            err.context()
                .contains(&"jdbcDriverName=mock, jdbcMappingName=mock:orders".to_string())
        );
        assert!(service.member(&tx).is_none());
    }

    #[tokio::test]
    async fn test_execution_failure_carries_identity() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let tx = Transaction::new();
        connector.state().fail_sql_containing(Some("broken"));

        let err = service.select(&tx, "SELECT broken FROM t", &[]).await.unwrap_err();
        assert!(matches!(err, SqlError::Processing { .. }));
        assert!(err.context().iter().any(|c| c.starts_with("service=orders, connectionId=")));
    }

    #[tokio::test]
    async fn test_data_source_connections_closed_on_release() {
        let connector = MockConnector::new();
        let registry = DataSourceRegistry::new();
        registry.register("java:comp/env/jdbc/orders", Arc::new(connector.clone()));
        let hooks = Arc::new(RecordingHooks::default());
        let service = SqlService::builder(SqlServiceConfig {
            direct_jdbc_connection: Some(false),
            jndi_name: Some("jdbc/orders".to_string()),
            jndi_url_pkg_prefixes: Some("java:comp/env/".to_string()),
            ..SqlServiceConfig::default()
        })
        .data_sources(registry)
        .hooks(hooks.clone())
        .build()
        .unwrap();
        assert!(service.pool().is_none());
        assert!(service.inventory().is_none());

        let tx = Transaction::new();
        let conn = service.connection(&tx).await.unwrap();
        tx.finish(true).await.unwrap();

        assert_eq!(connector.state().log().closed_connections, vec![conn.id()]);
        // Data source connections skip the creation hook.
        assert_eq!(
            *hooks.events.lock().unwrap(),
            vec!["begin".to_string(), "end:true".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_data_source() {
        let service = SqlService::builder(SqlServiceConfig {
            direct_jdbc_connection: Some(false),
            jndi_name: Some("jdbc/missing".to_string()),
            ..SqlServiceConfig::default()
        })
        .data_sources(DataSourceRegistry::new())
        .build()
        .unwrap();

        let err = service.connection(&Transaction::new()).await.unwrap_err();
        assert_eq!(err.context(), ["jndiName=jdbc/missing"]);
    }

    #[tokio::test]
    async fn test_sequence_next_value() {
        let connector = MockConnector::new();
        connector
            .state()
            .script_rows("SELECT ORDER_SEQ.NEXTVAL FROM DUAL", vec![vec![Value::Int(17)]]);
        let service = service(&connector);
        let tx = Transaction::new();

        assert_eq!(service.sequence_next_value(&tx, "ORDER_SEQ").await.unwrap(), 17);
        assert_eq!(service.sequence_next_value(&tx, "EMPTY_SEQ").await.unwrap(), 0);
        assert!(matches!(
            service.sequence_next_value(&tx, "x; DROP TABLE t").await,
            Err(SqlError::IllegalArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_transaction_rejected() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let tx = Transaction::new();
        tx.cancel();

        let err = service.select(&tx, "SELECT 1 FROM DUAL", &[]).await.unwrap_err();
        assert!(matches!(err, SqlError::Cancelled { .. }));
        assert_eq!(connector.state().log().connects, 0);
    }

    #[test]
    fn test_create_plain_text_uses_descriptors() {
        let service = SqlService::builder(config())
            .connector(Arc::new(MockConnector::new()))
            .descriptors(
                DescriptorIndex::new()
                    .with(Descriptor::new("com.acme.OpenCode").with_field(ID_FIELD, 3_i64)),
            )
            .sweep_interval(None)
            .build()
            .unwrap();

        let text = service
            .create_plain_text(
                "SELECT * FROM orders WHERE status = ::code(OpenCode) AND owner = :owner",
                &[BindBase::pair("owner", "bob")],
            )
            .unwrap();
        assert_eq!(
            text,
            "SELECT * FROM orders WHERE status = 3 AND owner = 'bob'"
        );
    }
}
