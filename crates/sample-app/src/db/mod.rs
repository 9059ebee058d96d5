//! Simulated relational database.
//!
//! Tables live in memory and are replaced atomically (see [`Table`]). Every
//! query opens a child span of the caller's scope carrying the usual `db.*`
//! attributes, and logs before and after the query against that span.

mod table;

pub use table::Table;

use std::{ops::Range, sync::Arc};

use common::protocol::{Order, User};
use correlation::{AttributeValue, Level, Scope};
use rand::Rng;
use thiserror::Error;

use crate::latency::{self, Latency};

/// Errors returned by simulated queries.
#[derive(Debug, Error)]
pub enum DbError {
    /// Injected according to the configured failure rate.
    #[error("connection lost while querying {table}")]
    ConnectionLost { table: &'static str },
}

/// Handle to the simulated database. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    users: Table<User>,
    orders: Table<Order>,
    latency: Latency,
    failure_rate: f64,
}

impl Database {
    /// Create a database seeded with the demo rows.
    ///
    /// `failure_rate` is the probability that any one query fails; it is
    /// clamped to `0.0..=1.0`.
    pub fn new(latency: Latency, failure_rate: f64) -> Self {
        let db = Self {
            inner: Arc::new(Inner {
                users: Table::new("users", Vec::new()),
                orders: Table::new("orders", Vec::new()),
                latency,
                failure_rate: failure_rate.clamp(0.0, 1.0),
            }),
        };
        db.seed();
        db
    }

    /// Replace every table with the demo rows.
    pub fn seed(&self) {
        self.users().replace(seed_users());
        self.orders().replace(seed_orders());
    }

    pub fn users(&self) -> &Table<User> {
        &self.inner.users
    }

    pub fn orders(&self) -> &Table<Order> {
        &self.inner.orders
    }

    /// `SELECT * FROM users` under a `fetch-users-from-db` span.
    pub async fn query_users(&self, parent: &Scope) -> Result<Arc<Vec<User>>, DbError> {
        self.select(parent, "fetch-users-from-db", &self.inner.users, latency::USERS_QUERY)
            .await
    }

    /// `SELECT * FROM orders` under a `fetch-orders-from-db` span.
    pub async fn query_orders(&self, parent: &Scope) -> Result<Arc<Vec<Order>>, DbError> {
        self.select(parent, "fetch-orders-from-db", &self.inner.orders, latency::ORDERS_QUERY)
            .await
    }

    async fn select<T>(
        &self,
        parent: &Scope,
        span_name: &str,
        table: &Table<T>,
        duration: Range<f64>,
    ) -> Result<Arc<Vec<T>>, DbError> {
        let mut span = parent.child(span_name);
        span.set_attribute("db.system", "postgresql");
        span.set_attribute("db.operation", "SELECT");
        span.set_attribute("db.table", table.name());
        span.info(format!("querying {}", table.name()));

        self.inner.latency.pause(duration).await;
        let result = if self.should_fail() {
            Err(DbError::ConnectionLost {
                table: table.name(),
            })
        } else {
            Ok(table.snapshot())
        };
        span.set_attribute("db.execution_time_ms", span.elapsed_ms());

        match &result {
            Ok(rows) => {
                span.set_attribute("db.row_count", rows.len());
                span.scope().log_with(
                    Level::Info,
                    "query complete",
                    [("db.row_count", AttributeValue::from(rows.len()))],
                );
            }
            Err(e) => span.scope().log_with(
                Level::Error,
                format!("query failed: {e}"),
                [("db.table", AttributeValue::from(table.name()))],
            ),
        }
        span.end_with(&result);
        result
    }

    fn should_fail(&self) -> bool {
        self.inner.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.inner.failure_rate)
    }
}

fn seed_users() -> Vec<User> {
    [
        (1, "Alice", "alice@example.com"),
        (2, "Bob", "bob@example.com"),
        (3, "Charlie", "charlie@example.com"),
    ]
    .into_iter()
    .map(|(id, name, email)| User {
        id,
        name: name.into(),
        email: email.into(),
    })
    .collect()
}

fn seed_orders() -> Vec<Order> {
    vec![
        Order {
            id: 101,
            user_id: 1,
            total: 99.99,
            status: "shipped".into(),
        },
        Order {
            id: 102,
            user_id: 2,
            total: 149.50,
            status: "pending".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use correlation::{Emitter, IdGenerator, MemorySink, SpanStatus};

    fn emitter() -> (Emitter, MemorySink) {
        let sink = MemorySink::new();
        let emitter = Emitter::new(
            "sample-app",
            IdGenerator::from_os_rng().unwrap(),
            Arc::new(sink.clone()),
        );
        (emitter, sink)
    }

    #[tokio::test]
    async fn query_users_returns_seed_rows_under_db_span() {
        let (emitter, sink) = emitter();
        let db = Database::new(Latency::new(false), 0.0);
        let root = emitter.start_unit("GET /api/users", None);

        let users = db.query_users(root.scope()).await.unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0].name, "Alice");
        let root_ctx = root.context();
        root.end_ok();

        let spans = sink.spans();
        let db_span = &spans[0];
        assert_eq!(db_span.name, "fetch-users-from-db");
        assert_eq!(db_span.parent_span_id, Some(root_ctx.span_id));
        assert_eq!(db_span.attributes["db.system"], AttributeValue::from("postgresql"));
        assert_eq!(db_span.attributes["db.operation"], AttributeValue::from("SELECT"));
        assert_eq!(db_span.attributes["db.table"], AttributeValue::from("users"));
        assert_eq!(db_span.attributes["db.row_count"], AttributeValue::Int(3));
        assert!(db_span.attributes.contains_key("db.execution_time_ms"));
        assert_eq!(db_span.status, SpanStatus::Ok);

        let messages: Vec<_> = sink.logs().into_iter().map(|l| l.message).collect();
        assert_eq!(messages[..2], ["querying users", "query complete"]);
    }

    #[tokio::test]
    async fn failed_query_errors_span_and_omits_row_count() {
        let (emitter, sink) = emitter();
        let db = Database::new(Latency::new(false), 1.0);
        let root = emitter.start_unit("GET /api/orders", None);

        let err = db.query_orders(root.scope()).await.unwrap_err();
        assert_eq!(err.to_string(), "connection lost while querying orders");
        drop(root);

        let db_span = &sink.spans()[0];
        assert!(!db_span.attributes.contains_key("db.row_count"));
        assert_eq!(
            db_span.status,
            SpanStatus::Error {
                description: "connection lost while querying orders".into()
            }
        );
        let failed = &sink.logs()[1];
        assert_eq!(failed.level, Level::Error);
        assert_eq!(failed.message, "query failed: connection lost while querying orders");
        assert_eq!(failed.span_id, Some(db_span.span_id));
    }

    #[tokio::test]
    async fn replaced_rows_are_visible_to_later_queries() {
        let (emitter, _sink) = emitter();
        let db = Database::new(Latency::new(false), 0.0);
        db.users().replace(Vec::new());
        let root = emitter.start_unit("GET /api/users", None);
        assert!(db.query_users(root.scope()).await.unwrap().is_empty());
        root.end_ok();
    }

    #[tokio::test]
    async fn seed_restores_demo_rows() {
        let (emitter, _sink) = emitter();
        let db = Database::new(Latency::new(false), 0.0);
        db.orders().replace(Vec::new());
        db.seed();
        let root = emitter.start_unit("GET /api/orders", None);
        let orders = db.query_orders(root.scope()).await.unwrap();
        assert_eq!(orders.iter().map(|o| o.id).collect::<Vec<_>>(), [101, 102]);
        root.end_ok();
    }

    #[test]
    fn failure_rate_is_clamped() {
        let db = Database::new(Latency::new(false), 7.0);
        assert!(db.should_fail());
        let db = Database::new(Latency::new(false), -1.0);
        assert!(!db.should_fail());
    }
}
