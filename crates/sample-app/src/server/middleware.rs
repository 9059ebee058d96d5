//! Axum middleware layers applied to the router.
//!
//! [`trace_request`] turns every traced request into one unit of work: it
//! adopts or mints the trace context, hands handlers a [`correlation::Scope`]
//! through the request extensions, and closes the root span once the response
//! is ready.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header::USER_AGENT, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use correlation::{AttributeValue, Emitter, Level, TraceParent, TRACEPARENT_HEADER};
use tracing::debug;

use super::state::AppState;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Counter incremented once per traced request.
pub const REQUESTS_METRIC: &str = "http.server.requests";
/// Timer recording each traced request's duration.
pub const DURATION_METRIC: &str = "http.server.duration";

/// Failure description a handler attaches to its response.
///
/// Becomes the root span's error description.
#[derive(Debug, Clone)]
pub struct HandlerFailure(pub String);

/// Records the request count and duration when dropped, so requests cut
/// short by a timeout or a disconnect are still counted.
struct RequestMetrics {
    emitter: Emitter,
    operation: String,
    started: Instant,
}

impl Drop for RequestMetrics {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.emitter.count(REQUESTS_METRIC, &self.operation, 1);
        self.emitter.time(DURATION_METRIC, &self.operation, elapsed_ms);
    }
}

/// Run the request as a unit of work named `<METHOD> <route>`.
pub async fn trace_request(
    State(state): State<AppState>,
    matched: Option<MatchedPath>,
    client: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let route = match &matched {
        Some(path) => path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let operation = format!("{method} {route}");

    let _metrics = RequestMetrics {
        emitter: state.emitter.clone(),
        operation: operation.clone(),
        started: Instant::now(),
    };

    let inbound = inbound_traceparent(req.headers());
    let mut root = state.emitter.start_unit(operation, inbound.as_ref());
    root.set_attribute("http.method", method.as_str());
    root.set_attribute("http.route", route.as_str());
    if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        root.set_attribute("http.user_agent", agent);
    }
    if let Some(ConnectInfo(addr)) = client {
        let ip = addr.ip().to_string();
        root.set_attribute("client.address", ip.as_str());
        root.set_closing_field("client.address", ip);
    }
    root.scope().log_with(
        Level::Info,
        "request received",
        [
            ("http.method", AttributeValue::from(method.as_str())),
            ("http.route", AttributeValue::from(route.as_str())),
        ],
    );
    req.extensions_mut().insert(root.scope().clone());

    let mut response = next.run(req).await;

    let status = response.status();
    root.set_attribute("http.status_code", status.as_u16());
    root.set_closing_field("http.status_code", status.as_u16());
    let traceparent = root.context().traceparent().to_string();
    let failure = response.extensions_mut().remove::<HandlerFailure>();
    match failure {
        Some(HandlerFailure(description)) => root.end_error(description),
        None if status.is_server_error() => root.end_error(format!("HTTP {}", status.as_u16())),
        None => root.end_ok(),
    }

    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        response.headers_mut().insert(TRACEPARENT_HEADER, value);
    }
    response
}

/// Parse an inbound `traceparent`. A malformed header is ignored and a fresh
/// trace is started instead.
fn inbound_traceparent(headers: &HeaderMap) -> Option<TraceParent> {
    let raw = headers.get(TRACEPARENT_HEADER)?.to_str().ok()?;
    match raw.parse() {
        Ok(tp) => Some(tp),
        Err(e) => {
            debug!(error = %e, "ignoring malformed traceparent");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::state::testing;
    use axum::{
        body::Body,
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use tower::ServiceExt;
    use tower_http::timeout::TimeoutLayer;

    fn headers(value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(TRACEPARENT_HEADER, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn well_formed_traceparent_is_adopted() {
        let tp = inbound_traceparent(&headers(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ))
        .unwrap();
        assert_eq!(tp.trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    async fn hang() -> &'static str {
        std::future::pending::<()>().await;
        "unreachable"
    }

    fn hanging_app(state: AppState) -> Router {
        Router::new()
            .route("/hang", get(hang))
            .route_layer(from_fn_with_state(state.clone(), trace_request))
            .layer(TimeoutLayer::new(Duration::from_millis(20)))
            .with_state(state)
    }

    #[tokio::test]
    async fn timed_out_requests_are_still_measured() {
        let (state, sink) = testing::state(0.0);
        let req = axum::http::Request::builder().uri("/hang").body(Body::empty()).unwrap();
        let resp = hanging_app(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);

        let metrics = sink.metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().any(|m| m.name == REQUESTS_METRIC));
        assert!(metrics.iter().any(|m| m.name == DURATION_METRIC));
        assert!(metrics.iter().all(|m| m.operation == "GET /hang"));

        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].status.is_error());
    }

    #[tokio::test]
    async fn closing_record_carries_status_and_client_address() {
        let (state, sink) = testing::state(0.0);
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(state.clone(), trace_request))
            .with_state(state);
        let mut req = axum::http::Request::builder().uri("/ok").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 1, 2, 3], 51000))));
        app.oneshot(req).await.unwrap();

        let logs = sink.logs();
        let closing = logs.last().unwrap();
        assert_eq!(closing.message, "GET /ok completed");
        assert_eq!(closing.fields["http.status_code"], AttributeValue::Int(200));
        assert_eq!(
            closing.fields["client.address"],
            AttributeValue::String("10.1.2.3".into())
        );
    }

    #[test]
    fn malformed_or_missing_traceparent_is_ignored() {
        assert!(inbound_traceparent(&headers("00-not-a-trace-01")).is_none());
        assert!(inbound_traceparent(&headers(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        ))
        .is_none());
        assert!(inbound_traceparent(&HeaderMap::new()).is_none());
    }
}
