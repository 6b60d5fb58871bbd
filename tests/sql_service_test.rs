//! Integration tests for the transactional SQL service.
//!
//! Tests verify that:
//! - Pooled connections are reused across units of work
//! - A unit of work holds one connection and one statement cache
//! - Commit and rollback follow the end-of-transaction hook semantics
//! - Custom bind functions resolve against the descriptor registry

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};
use txsql::SqlServiceConfig;
use txsql::db::functions::{Descriptor, DescriptorIndex, ID_FIELD};
use txsql::db::mock::MockConnector;
use txsql::db::{Connection, SqlService, SqlServiceHooks, Transaction};
use txsql::error::{SqlError, SqlResult};
use txsql::models::{BindBase, Holder, Value};

fn config(pool_size: usize) -> SqlServiceConfig {
    SqlServiceConfig {
        name: Some("orders".to_string()),
        jdbc_driver_name: Some("mock".to_string()),
        pool_size: Some(pool_size),
        statement_cache_size: Some(2),
        ..SqlServiceConfig::for_mapping_name("mock:orders")
    }
}

fn service(connector: &MockConnector, pool_size: usize) -> SqlService {
    SqlService::builder(config(pool_size))
        .connector(Arc::new(connector.clone()))
        .sweep_interval(None)
        .build()
        .unwrap()
}

/// Captures formatted log output for the current thread.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }
}

#[tokio::test]
async fn test_pool_size_one_reuses_connection() {
    let connector = MockConnector::new();
    let service = service(&connector, 1);

    let first = Transaction::new();
    let conn_a = service.connection(&first).await.unwrap();
    first.finish(true).await.unwrap();

    let second = Transaction::new();
    let conn_b = service.connection(&second).await.unwrap();
    second.finish(true).await.unwrap();

    assert_eq!(conn_a.id(), conn_b.id());
    assert_eq!(connector.state().log().connects, 1);
    let stats = service.pool().unwrap().stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.leased, 0);
}

#[tokio::test]
async fn test_pool_size_one_exhausted_while_leased() {
    let connector = MockConnector::new();
    let service = service(&connector, 1);

    let first = Transaction::new();
    service.connection(&first).await.unwrap();

    let second = Transaction::new();
    let err = service.connection(&second).await.unwrap_err();
    assert!(matches!(err, SqlError::PoolExhausted { .. }));
    assert!(err.is_acquisition_failure());

    first.finish(true).await.unwrap();
    assert!(service.connection(&second).await.is_ok());
    second.finish(true).await.unwrap();
}

#[tokio::test]
async fn test_statement_cache_lifecycle() {
    let connector = MockConnector::new();
    let service = service(&connector, 2);
    let tx = Transaction::new();

    let cache = service.statement_cache(&tx).unwrap();
    assert!(Arc::ptr_eq(&cache, &service.statement_cache(&tx).unwrap()));

    service.select(&tx, "SELECT a FROM t", &[]).await.unwrap();
    service.select(&tx, "SELECT b FROM t", &[]).await.unwrap();
    service.select(&tx, "SELECT a FROM t", &[]).await.unwrap();
    service.select(&tx, "SELECT c FROM t", &[]).await.unwrap();

    // Capacity 2: "SELECT b" was least recently used.
    assert_eq!(
        connector.state().log().closed_statements,
        vec!["SELECT b FROM t".to_string()]
    );

    tx.finish(true).await.unwrap();
    assert!(cache.is_released());
    let closed = connector.state().log().closed_statements;
    assert!(closed.contains(&"SELECT a FROM t".to_string()));
    assert!(closed.contains(&"SELECT c FROM t".to_string()));
}

struct FailingCommitHook;

#[async_trait]
impl SqlServiceHooks for FailingCommitHook {
    async fn end_transaction(
        &self,
        _conn: &Arc<dyn Connection>,
        will_be_committed: bool,
    ) -> SqlResult<()> {
        if will_be_committed {
            Err(SqlError::processing("audit table unavailable"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_commit_attempted_when_hook_fails() {
    let logs = LogBuffer::default();
    let _guard = logs.install();

    let connector = MockConnector::new();
    let service = SqlService::builder(config(2))
        .connector(Arc::new(connector.clone()))
        .hooks(Arc::new(FailingCommitHook))
        .sweep_interval(None)
        .build()
        .unwrap();

    let tx = Transaction::new();
    service
        .update(&tx, "UPDATE orders SET state = :state", &[BindBase::pair("state", "OPEN")])
        .await
        .unwrap();
    tx.finish(true).await.unwrap();

    assert_eq!(connector.state().log().commits, 1);
    assert_eq!(connector.state().log().rollbacks, 0);
    assert!(logs.contents().contains("audit table unavailable"));
}

#[tokio::test]
async fn test_rollback_of_cancelled_transaction_is_quiet() {
    let logs = LogBuffer::default();
    let _guard = logs.install();

    let connector = MockConnector::new();
    connector.state().fail_rollback(true);
    let service = service(&connector, 2);

    let tx = Transaction::new();
    service.select(&tx, "SELECT 1 FROM DUAL", &[]).await.unwrap();
    assert!(tx.cancel());
    assert!(tx.finish(false).await.is_ok());

    assert_eq!(connector.state().log().rollbacks, 1);
    assert!(!logs.contents().contains("Rollback failed"));

    // The same failure outside a cancellation is logged.
    let tx = Transaction::new();
    service.select(&tx, "SELECT 1 FROM DUAL", &[]).await.unwrap();
    tx.finish(false).await.unwrap();
    assert!(logs.contents().contains("Rollback failed"));
}

fn code_service(connector: &MockConnector) -> SqlService {
    SqlService::builder(config(2))
        .connector(Arc::new(connector.clone()))
        .descriptors(
            DescriptorIndex::new()
                .with(Descriptor::new("com.acme.shared.OrderStatusCodeType").with_inner(
                    Descriptor::new("com.acme.shared.OrderStatusCodeType.OpenCode")
                        .with_field(ID_FIELD, 100_i64),
                ))
                .with(Descriptor::new("com.acme.shared.LegacyCode")),
        )
        .sweep_interval(None)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_code_function_resolves_id() {
    let connector = MockConnector::new();
    let service = code_service(&connector);
    let tx = Transaction::new();

    service
        .select(
            &tx,
            "SELECT id FROM orders WHERE status = ::code(OrderStatusCodeType.OpenCode)",
            &[],
        )
        .await
        .unwrap();
    tx.finish(true).await.unwrap();

    let executed = connector.state().log().executed;
    let (sql, params) = executed.last().unwrap();
    assert_eq!(sql, "SELECT id FROM orders WHERE status = ?");
    assert_eq!(params, &vec![Value::Int(100)]);
}

#[tokio::test]
async fn test_code_function_without_id_fails() {
    let connector = MockConnector::new();
    let service = code_service(&connector);
    let tx = Transaction::new();

    let err = service
        .select(&tx, "SELECT id FROM orders WHERE status = ::code(LegacyCode)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SqlError::Processing { .. }));
    assert!(err.to_string().contains("LegacyCode"));
    tx.finish(false).await.unwrap();
}

#[tokio::test]
async fn test_select_into_holder() {
    let connector = MockConnector::new();
    connector.state().script_rows(
        "SELECT name FROM customers WHERE id = ?",
        vec![vec![Value::from("Ada")]],
    );
    let service = service(&connector, 2);
    let tx = Transaction::new();
    let name = Holder::new();

    service
        .select_into(
            &tx,
            "SELECT name FROM customers WHERE id = :id INTO :name",
            &[BindBase::pair("id", 7_i64), BindBase::holder("name", &name)],
        )
        .await
        .unwrap();
    tx.finish(true).await.unwrap();

    assert_eq!(name.get(), Value::from("Ada"));
}
