//! Statement processing: resolving binds and running prepared statements.
//!
//! [`StatementProcessor::bind`] turns SQL text with named binds, positional
//! binds and custom bind functions into dialect SQL plus an ordered parameter
//! list. The execution methods then run a prepared statement and deliver rows
//! to the caller, to output holders or to a streaming handler.

use crate::db::binds::{self, Token};
use crate::db::connection::PreparedStatement;
use crate::db::functions::BindFunctionResolver;
use crate::db::style::SqlStyle;
use crate::error::{SqlError, SqlResult};
use crate::models::bind::{assign_outputs, lookup_input, lookup_output, positional_values};
use crate::models::{BindBase, OutputTarget, Row, Value};
use humansize::{BINARY, format_size};
use tracing::{debug, warn};

/// Receives the rows of a streaming select one at a time.
pub trait SelectStreamHandler: Send {
    fn handle_row(&mut self, row_index: u64, row: Row) -> SqlResult<()>;

    /// Called once after the last row.
    fn finished(&mut self, row_count: u64) -> SqlResult<()>;
}

/// SQL ready for preparation together with its bind values.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub outputs: Vec<OutputTarget>,
}

impl BoundStatement {
    fn failed(&self, e: SqlError) -> SqlError {
        e.with_context(format!("statement={}", self.sql))
    }
}

/// Tracks the approximate memory of fetched rows and warns once when it
/// exceeds the configured size.
struct FetchMemory<'a> {
    limit: usize,
    used: usize,
    warned: bool,
    sql: &'a str,
}

impl<'a> FetchMemory<'a> {
    fn new(limit: usize, sql: &'a str) -> Self {
        Self {
            limit,
            used: 0,
            warned: false,
            sql,
        }
    }

    fn add(&mut self, row: &Row) {
        self.used += row.iter().map(Value::estimated_size).sum::<usize>();
        if self.limit > 0 && self.used > self.limit && !self.warned {
            self.warned = true;
            warn!(
                limit = %format_size(self.limit, BINARY),
                sql = %self.sql,
                "Fetched rows exceed the max fetch memory size"
            );
        }
    }
}

pub struct StatementProcessor<'a> {
    style: &'a dyn SqlStyle,
    functions: &'a dyn BindFunctionResolver,
    max_fetch_memory_size: usize,
}

impl<'a> StatementProcessor<'a> {
    pub fn new(style: &'a dyn SqlStyle, functions: &'a dyn BindFunctionResolver) -> Self {
        Self {
            style,
            functions,
            max_fetch_memory_size: 0,
        }
    }

    pub fn with_max_fetch_memory_size(mut self, size: usize) -> Self {
        self.max_fetch_memory_size = size;
        self
    }

    /// Resolve all binds of `sql` against `bases`, rendering each value with `render`.
    fn resolve<F>(&self, sql: &str, bases: &[BindBase], mut render: F) -> SqlResult<(String, Vec<OutputTarget>)>
    where
        F: FnMut(Value) -> String,
    {
        let in_statement = |e: SqlError| e.with_context(format!("statement={}", sql));
        let parsed = binds::parse(sql)?;
        let mut positional = positional_values(bases).into_iter();
        let mut positional_index = 0;
        let mut out = String::with_capacity(sql.len());

        for token in parsed.tokens {
            match token {
                Token::Text(text) => out.push_str(&text),
                Token::Named(name) => {
                    let value = lookup_input(bases, &name).ok_or_else(|| {
                        in_statement(SqlError::processing(format!(
                            "Cannot find input for ':{}'",
                            name
                        )))
                    })?;
                    out.push_str(&render(value));
                }
                Token::Positional => {
                    positional_index += 1;
                    let value = positional.next().ok_or_else(|| {
                        in_statement(SqlError::processing(format!(
                            "Missing value for positional bind #{}",
                            positional_index
                        )))
                    })?;
                    out.push_str(&render(value));
                }
                Token::Function { name, args } => {
                    let value = self
                        .functions
                        .resolve(&name, &args, bases)
                        .map_err(in_statement)?;
                    out.push_str(&render(value));
                }
            }
        }

        let outputs = parsed
            .outputs
            .iter()
            .map(|name| {
                lookup_output(bases, name).ok_or_else(|| {
                    in_statement(SqlError::processing(format!(
                        "Cannot find output for ':{}'",
                        name
                    )))
                })
            })
            .collect::<SqlResult<Vec<_>>>()?;

        Ok((out, outputs))
    }

    /// Produce dialect SQL with placeholders and the matching parameter list.
    pub fn bind(&self, sql: &str, bases: &[BindBase]) -> SqlResult<BoundStatement> {
        let mut params = Vec::new();
        let style = self.style;
        let (sql, outputs) = self.resolve(sql, bases, |value| {
            params.push(value);
            style.placeholder(params.len())
        })?;
        Ok(BoundStatement {
            sql,
            params,
            outputs,
        })
    }

    /// Render `sql` with every bind replaced by an inline literal.
    pub fn plain_text(&self, sql: &str, bases: &[BindBase]) -> SqlResult<String> {
        let style = self.style;
        self.resolve(sql, bases, |value| style.literal(&value))
            .map(|(text, _)| text)
    }

    /// Run a query and collect its rows.
    pub async fn select(
        &self,
        statement: &dyn PreparedStatement,
        bound: &BoundStatement,
        max_rows: Option<usize>,
    ) -> SqlResult<Vec<Row>> {
        let mut rows = Vec::new();
        let mut memory = FetchMemory::new(self.max_fetch_memory_size, &bound.sql);
        let mut sink = |row: Row| -> SqlResult<()> {
            memory.add(&row);
            rows.push(row);
            Ok(())
        };
        statement
            .query(&bound.params, max_rows, &mut sink)
            .await
            .map_err(|e| bound.failed(e))?;
        debug!(rows = rows.len(), "Select completed");
        Ok(rows)
    }

    /// Run a query and write its columns into the `INTO` output binds.
    ///
    /// Single-value outputs take the first row; more than one row is an error
    /// unless every output is a list.
    pub async fn select_into(
        &self,
        statement: &dyn PreparedStatement,
        bound: &BoundStatement,
        max_rows: Option<usize>,
    ) -> SqlResult<usize> {
        let rows = self.select(statement, bound, max_rows).await?;
        let all_lists = bound.outputs.iter().all(OutputTarget::is_list);
        if rows.len() > 1 && !all_lists {
            return Err(bound.failed(SqlError::processing(format!(
                "Expected at most one row for single-value output binds, got {}",
                rows.len()
            ))));
        }
        assign_outputs(&bound.outputs, &rows);
        Ok(rows.len())
    }

    /// Run a query and hand each row to `handler` as it arrives.
    pub async fn select_streaming(
        &self,
        statement: &dyn PreparedStatement,
        bound: &BoundStatement,
        handler: &mut dyn SelectStreamHandler,
        max_rows: Option<usize>,
    ) -> SqlResult<u64> {
        let mut index = 0_u64;
        let mut memory = FetchMemory::new(self.max_fetch_memory_size, &bound.sql);
        let count = {
            let mut sink = |row: Row| -> SqlResult<()> {
                memory.add(&row);
                let current = index;
                index += 1;
                handler.handle_row(current, row)
            };
            statement
                .query(&bound.params, max_rows, &mut sink)
                .await
                .map_err(|e| bound.failed(e))?
        };
        handler.finished(count).map_err(|e| bound.failed(e))?;
        Ok(count)
    }

    /// Run an insert, update or delete and return the affected row count.
    pub async fn modify(&self, statement: &dyn PreparedStatement, bound: &BoundStatement) -> SqlResult<u64> {
        let affected = statement
            .execute(&bound.params)
            .await
            .map_err(|e| bound.failed(e))?;
        debug!(affected, "Modification completed");
        Ok(affected)
    }

    /// Run a stored procedure call. Returns `true` if it produced a result set;
    /// its first row is written into the output binds.
    pub async fn call_stored_procedure(
        &self,
        statement: &dyn PreparedStatement,
        bound: &BoundStatement,
    ) -> SqlResult<bool> {
        let rows = self.select(statement, bound, None).await?;
        if !bound.outputs.is_empty() {
            assign_outputs(&bound.outputs, &rows);
        }
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::{Connection, Connector};
    use crate::db::functions::{BindFunctions, Descriptor, DescriptorIndex, ID_FIELD};
    use crate::db::mock::MockConnector;
    use crate::db::style::{OracleSqlStyle, PostgreSqlStyle};
    use crate::models::{Holder, ListHolder};

    fn functions() -> BindFunctions {
        BindFunctions::new(
            DescriptorIndex::new()
                .with(Descriptor::new("com.acme.ActiveCode").with_field(ID_FIELD, 7_i64)),
        )
    }

    #[test]
    fn test_bind_named_positional_and_function() {
        let style = PostgreSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions);
        let bases = vec![
            BindBase::pair("name", "Ann"),
            BindBase::Positional(vec![Value::Int(3)]),
        ];

        let bound = processor
            .bind(
                "SELECT id FROM person WHERE name = :name AND age > ? AND status = ::code(ActiveCode)",
                &bases,
            )
            .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT id FROM person WHERE name = $1 AND age > $2 AND status = $3"
        );
        assert_eq!(
            bound.params,
            vec![Value::String("Ann".into()), Value::Int(3), Value::Int(7)]
        );
    }

    #[test]
    fn test_missing_binds() {
        let style = OracleSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions);

        let err = processor.bind("SELECT * FROM t WHERE a = :a", &[]).unwrap_err();
        assert!(err.to_string().contains(":a"));
        assert!(processor.bind("SELECT * FROM t WHERE a = ?", &[]).is_err());
        assert!(processor.bind("SELECT a FROM t INTO :out", &[]).is_err());
        assert!(matches!(
            processor.bind("SELECT ::nope(x)", &[]),
            Err(SqlError::IllegalArgument { .. })
        ));
    }

    #[test]
    fn test_plain_text() {
        let style = OracleSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions);
        let bases = vec![BindBase::pair("name", "O'Hara"), BindBase::pair("flag", true)];

        let text = processor
            .plain_text(
                "UPDATE person SET flag = :flag, status = ::code(ActiveCode) WHERE name = :name",
                &bases,
            )
            .unwrap();
        assert_eq!(
            text,
            "UPDATE person SET flag = 1, status = 7 WHERE name = 'O''Hara'"
        );
    }

    #[tokio::test]
    async fn test_select_into_holders() {
        let connector = MockConnector::new();
        let state = connector.state();
        state.script_rows(
            "SELECT a, b FROM t",
            vec![vec![Value::Int(1), Value::from("x")]],
        );
        state.script_rows(
            "SELECT a FROM many",
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        let conn = connector.connect().await.unwrap();

        let style = OracleSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions);
        let a = Holder::new();
        let b = Holder::new();
        let bases = vec![BindBase::holder("a", &a), BindBase::holder("b", &b)];

        let bound = processor.bind("SELECT a, b FROM t INTO :a, :b", &bases).unwrap();
        let statement = conn.prepare(&bound.sql).await.unwrap();
        assert_eq!(processor.select_into(statement.as_ref(), &bound, None).await.unwrap(), 1);
        assert_eq!(a.get(), Value::Int(1));
        assert_eq!(b.get(), Value::from("x"));

        // Two rows into a scalar holder fail, into a list holder succeed.
        let bound = processor.bind("SELECT a FROM many INTO :a", &bases).unwrap();
        let statement = conn.prepare(&bound.sql).await.unwrap();
        assert!(processor.select_into(statement.as_ref(), &bound, None).await.is_err());

        let list = ListHolder::new();
        let list_bases = vec![BindBase::list("a", &list)];
        let bound = processor.bind("SELECT a FROM many INTO :a", &list_bases).unwrap();
        processor.select_into(statement.as_ref(), &bound, None).await.unwrap();
        assert_eq!(list.values(), vec![Value::Int(1), Value::Int(2)]);
    }

    struct Collect {
        rows: Vec<(u64, Row)>,
        finished: Option<u64>,
    }

    impl SelectStreamHandler for Collect {
        fn handle_row(&mut self, row_index: u64, row: Row) -> SqlResult<()> {
            self.rows.push((row_index, row));
            Ok(())
        }

        fn finished(&mut self, row_count: u64) -> SqlResult<()> {
            self.finished = Some(row_count);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_streaming_respects_max_rows() {
        let connector = MockConnector::new();
        connector.state().script_rows(
            "SELECT n FROM numbers",
            (0..5).map(|n| vec![Value::Int(n)]).collect(),
        );
        let conn = connector.connect().await.unwrap();

        let style = OracleSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions).with_max_fetch_memory_size(8);
        let bound = processor.bind("SELECT n FROM numbers", &[]).unwrap();
        let statement = conn.prepare(&bound.sql).await.unwrap();

        let mut handler = Collect {
            rows: Vec::new(),
            finished: None,
        };
        let count = processor
            .select_streaming(statement.as_ref(), &bound, &mut handler, Some(3))
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(handler.finished, Some(3));
        assert_eq!(handler.rows[2], (2, vec![Value::Int(2)]));
    }

    #[tokio::test]
    async fn test_execution_error_carries_statement() {
        let connector = MockConnector::new();
        let conn = connector.connect().await.unwrap();
        let style = OracleSqlStyle;
        let functions = functions();
        let processor = StatementProcessor::new(&style, &functions);

        let bound = processor.bind("DELETE FROM t", &[]).unwrap();
        let statement = conn.prepare(&bound.sql).await.unwrap();
        connector.state().fail_sql_containing(Some("DELETE"));
        let err = processor.modify(statement.as_ref(), &bound).await.unwrap_err();
        assert!(err.context().iter().any(|c| c == "statement=DELETE FROM t"));
    }
}
