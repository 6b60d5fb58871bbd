//! Backend dispatch macros for reducing code duplication.
//!
//! Each macro expands its body once per backend, so the body is type-checked
//! against the concrete sqlx connection and argument types of every arm.

/// Generate match arms over the [`Backend`](crate::db::backend::Backend) variants.
///
/// # Example
///
/// ```ignore
/// backend_dispatch!(backend, conn => sqlx::Connection::ping(conn).await)
/// ```
macro_rules! backend_dispatch {
    ($backend:expr, $conn:ident => $body:expr) => {
        match $backend {
            $crate::db::backend::Backend::Sqlite($conn) => $body,
            $crate::db::backend::Backend::Postgres($conn) => $body,
            $crate::db::backend::Backend::MySql($conn) => $body,
        }
    };
}

/// Bind a slice of [`Value`](crate::models::Value)s to a sqlx query.
macro_rules! bind_values {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                $crate::models::Value::Null => query.bind(None::<String>),
                $crate::models::Value::Bool(v) => query.bind(*v),
                $crate::models::Value::Int(v) => query.bind(*v),
                $crate::models::Value::Float(v) => query.bind(*v),
                $crate::models::Value::String(v) => query.bind(v.clone()),
                $crate::models::Value::Bytes(v) => query.bind(v.clone()),
            };
        }
        query
    }};
}

pub(crate) use backend_dispatch;
pub(crate) use bind_values;
