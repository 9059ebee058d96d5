//! Axum request handlers for all service endpoints.
//!
//! Traced handlers receive the request's [`Scope`] as an extension and emit
//! a fixed number of log records per request, whatever the data volume.

use std::fmt;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use common::{
    error::ServiceError,
    protocol::{
        ErrorResponse, HealthResponse, HomeResponse, Order, OrdersResponse, SlowResponse,
        UsersResponse,
    },
};
use correlation::{AttributeValue, Level, Scope};

use super::{middleware::HandlerFailure, state::AppState};
use crate::{db::DbError, latency};

/// Routes listed by `GET /`.
pub const ENDPOINTS: [&str; 6] = [
    "/",
    "/api/users",
    "/api/orders",
    "/api/slow",
    "/error",
    "/health",
];

/// Message of the error raised by `GET /error`.
pub const SIMULATED_ERROR: &str = "Simulated error for testing!";

/// `GET /`: welcome message and route list.
pub async fn home(Extension(scope): Extension<Scope>) -> Json<HomeResponse> {
    scope.info("Home endpoint called");
    Json(HomeResponse {
        message: "Welcome to the OTEL Demo App!".into(),
        endpoints: ENDPOINTS.iter().map(|e| (*e).to_owned()).collect(),
    })
}

/// `GET /api/users`: all users.
pub async fn users(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
) -> Result<Json<UsersResponse>, AppError> {
    let users = state.db.query_users(&scope).await?;
    scope.log_with(
        Level::Info,
        format!("Returned {} users", users.len()),
        [("user.count", AttributeValue::from(users.len()))],
    );
    Ok(Json(UsersResponse {
        users: users.to_vec(),
    }))
}

/// `GET /api/orders`: all orders, validated and enriched under `process-orders`.
pub async fn orders(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
) -> Result<Json<OrdersResponse>, AppError> {
    let mut process = scope.child("process-orders");
    let result = process_orders(&state, process.scope()).await;
    if let Ok(orders) = &result {
        process.set_attribute("order.count", orders.len());
    }
    process.end_with(&result);

    let orders = result?;
    scope.log_with(
        Level::Info,
        format!("Returned {} orders", orders.len()),
        [("order.count", AttributeValue::from(orders.len()))],
    );
    Ok(Json(OrdersResponse { orders }))
}

async fn process_orders(state: &AppState, scope: &Scope) -> Result<Vec<Order>, AppError> {
    let validate = scope.child("validate-request");
    validate.info("validating request");
    state.latency.pause(latency::VALIDATE_REQUEST).await;
    validate.end_ok();

    let orders = state.db.query_orders(scope).await?;

    let enrich = scope.child("enrich-order-data");
    enrich.info(format!("enriching {} orders", orders.len()));
    state.latency.pause(latency::ENRICH_ORDERS).await;
    enrich.end_ok();

    Ok(orders.to_vec())
}

/// `GET /api/slow`: a deliberately slow operation.
pub async fn slow(
    State(state): State<AppState>,
    Extension(scope): Extension<Scope>,
) -> Json<SlowResponse> {
    let mut span = scope.child("slow-operation");
    span.info("starting slow operation");
    let delay = state.latency.pause(latency::SLOW_OPERATION).await;
    span.set_attribute("delay.seconds", delay);
    span.end_ok();

    scope.warn(format!("Slow endpoint completed after {delay:.2}s"));
    Json(SlowResponse {
        message: "Slow operation completed".into(),
        delay,
    })
}

/// `GET /error`: always fails with a simulated error.
pub async fn error(Extension(scope): Extension<Scope>) -> AppError {
    let mut span = scope.child("error-operation");
    span.set_attribute("error.simulated", true);
    let err = ServiceError::Simulated(SIMULATED_ERROR.into());
    span.error(format!("Error occurred: {err}"));
    span.end_error(err.to_string());
    AppError(err)
}

/// `GET /health`: liveness check. Not traced.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        service: state.emitter.service().to_owned(),
        dropped_records: state.emitter.dropped(),
    })
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

/// A [`ServiceError`] returned from a handler.
///
/// Renders as an [`ErrorResponse`] and tags the response with a
/// [`HandlerFailure`] so the root span records why the request failed.
#[derive(Debug)]
pub struct AppError(pub ServiceError);

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        AppError(ServiceError::Database(e.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let description = self.0.to_string();
        let body = ErrorResponse::new(self.0.code(), description.clone());
        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(HandlerFailure(description));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{router, state::testing};
    use axum::http::{HeaderName, HeaderValue};
    use axum_test::TestServer;
    use common::protocol::User;
    use correlation::{SpanStatus, TraceId, TraceParent};

    fn trace_id_of(resp: &axum_test::TestResponse) -> TraceId {
        let header = resp.header("traceparent");
        let tp: TraceParent = header.to_str().unwrap().parse().unwrap();
        tp.trace_id
    }

    fn server(db_failure_rate: f64) -> (TestServer, AppState, correlation::MemorySink) {
        let (state, sink) = testing::state(db_failure_rate);
        let server = TestServer::new(router::build(state.clone())).unwrap();
        (server, state, sink)
    }

    #[tokio::test]
    async fn home_emits_three_records() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/").await;
        resp.assert_status_ok();
        let body: HomeResponse = resp.json();
        assert_eq!(body.endpoints.len(), 6);

        let logs = sink.logs_for(trace_id_of(&resp));
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["request received", "Home endpoint called", "GET / completed"]);
    }

    #[tokio::test]
    async fn users_emits_five_records_with_db_span() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/api/users").await;
        resp.assert_status_ok();
        assert_eq!(resp.json::<UsersResponse>().users.len(), 3);

        let trace_id = trace_id_of(&resp);
        assert_eq!(sink.logs_for(trace_id).len(), 5);
        let spans = sink.spans_for(trace_id);
        let names: Vec<_> = spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["fetch-users-from-db", "GET /api/users"]);
        let root = &spans[1];
        assert_eq!(root.attributes["http.status_code"], AttributeValue::Int(200));
        assert_eq!(root.attributes["http.route"], AttributeValue::from("/api/users"));
        assert_eq!(spans[0].parent_span_id, Some(root.span_id));
    }

    #[tokio::test]
    async fn log_count_does_not_grow_with_rows() {
        let (server, state, sink) = server(0.0);
        let many: Vec<User> = (0..10_000)
            .map(|id| User {
                id,
                name: format!("user-{id}"),
                email: format!("user-{id}@example.com"),
            })
            .collect();
        state.db.users().replace(many);

        let resp = server.get("/api/users").await;
        resp.assert_status_ok();
        assert_eq!(resp.json::<UsersResponse>().users.len(), 10_000);
        assert_eq!(sink.logs_for(trace_id_of(&resp)).len(), 5);
    }

    #[tokio::test]
    async fn users_database_failure_emits_four_records() {
        let (server, _, sink) = server(1.0);
        let resp = server.get("/api/users").await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = resp.json();
        assert_eq!(body.code, "database_error");

        let trace_id = trace_id_of(&resp);
        let logs = sink.logs_for(trace_id);
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[3].message, "GET /api/users failed");
        assert_eq!(logs[3].level, Level::Error);

        let root = sink.spans_for(trace_id).pop().unwrap();
        assert_eq!(
            root.status,
            SpanStatus::Error {
                description: "database error: connection lost while querying users".into()
            }
        );
    }

    #[tokio::test]
    async fn orders_nests_steps_under_process_orders() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/api/orders").await;
        resp.assert_status_ok();
        assert_eq!(resp.json::<OrdersResponse>().orders.len(), 2);

        let trace_id = trace_id_of(&resp);
        assert_eq!(sink.logs_for(trace_id).len(), 7);
        let spans = sink.spans_for(trace_id);
        let process = spans.iter().find(|s| s.name == "process-orders").unwrap();
        let root = spans.iter().find(|s| s.name == "GET /api/orders").unwrap();
        assert_eq!(process.parent_span_id, Some(root.span_id));
        for step in ["validate-request", "fetch-orders-from-db", "enrich-order-data"] {
            let span = spans.iter().find(|s| s.name == step).unwrap();
            assert_eq!(span.parent_span_id, Some(process.span_id), "{step}");
        }
        assert_eq!(process.attributes["order.count"], AttributeValue::Int(2));
    }

    #[tokio::test]
    async fn orders_database_failure_emits_five_records() {
        let (server, _, sink) = server(1.0);
        let resp = server.get("/api/orders").await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);

        let trace_id = trace_id_of(&resp);
        assert_eq!(sink.logs_for(trace_id).len(), 5);
        let spans = sink.spans_for(trace_id);
        assert!(spans.iter().all(|s| s.name == "validate-request" || s.status.is_error()));
        assert!(!spans.iter().any(|s| s.name == "enrich-order-data"));
    }

    #[tokio::test]
    async fn slow_warns_with_delay() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/api/slow").await;
        resp.assert_status_ok();
        let body: SlowResponse = resp.json();

        let logs = sink.logs_for(trace_id_of(&resp));
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[2].level, Level::Warn);
        assert_eq!(
            logs[2].message,
            format!("Slow endpoint completed after {:.2}s", body.delay)
        );
        let slow = sink.spans().into_iter().find(|s| s.name == "slow-operation").unwrap();
        assert_eq!(slow.attributes["delay.seconds"], AttributeValue::Float(body.delay));
    }

    #[tokio::test]
    async fn error_route_fails_root_with_simulated_error() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/error").await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = resp.json();
        assert_eq!(body.message, SIMULATED_ERROR);

        let trace_id = trace_id_of(&resp);
        let logs = sink.logs_for(trace_id);
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            messages,
            [
                "request received",
                "Error occurred: Simulated error for testing!",
                "GET /error failed"
            ]
        );
        assert_eq!(logs[2].fields["error"], AttributeValue::from(SIMULATED_ERROR));

        let spans = sink.spans_for(trace_id);
        assert_eq!(spans[0].name, "error-operation");
        assert_eq!(spans[0].attributes["error.simulated"], AttributeValue::Bool(true));
        assert!(spans.iter().all(|s| s.status.is_error()));
    }

    #[tokio::test]
    async fn inbound_traceparent_is_adopted_and_echoed() {
        let (server, _, sink) = server(0.0);
        let inbound = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let resp = server
            .get("/")
            .add_header(
                HeaderName::from_static("traceparent"),
                HeaderValue::from_static(inbound),
            )
            .await;
        let trace_id = trace_id_of(&resp);
        assert_eq!(trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");

        let root = sink.spans_for(trace_id).pop().unwrap();
        assert_eq!(root.parent_span_id.unwrap().to_string(), "00f067aa0ba902b7");
        assert!(root.parent_is_remote);
        let echoed: TraceParent = resp.header("traceparent").to_str().unwrap().parse().unwrap();
        assert_eq!(echoed.parent_id, root.span_id);
    }

    #[tokio::test]
    async fn health_is_untraced() {
        let (server, _, sink) = server(0.0);
        let resp = server.get("/health").await;
        resp.assert_status_ok();
        let body: HealthResponse = resp.json();
        assert_eq!(body.status, "healthy");
        assert_eq!(body.service, "sample-app");
        assert!(sink.signals().is_empty());
    }

    #[tokio::test]
    async fn every_traced_request_records_metrics_without_ids() {
        let (server, _, sink) = server(0.0);
        server.get("/").await.assert_status_ok();
        let metrics = sink.metrics();
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["http.server.requests", "http.server.duration"]);
        assert!(metrics.iter().all(|m| m.operation == "GET /"));
    }
}
