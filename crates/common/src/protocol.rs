//! Request and response bodies of the sample HTTP API.
//!
//! All bodies are JSON. Field names match what dashboards and traffic
//! generators built against the service expect.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
}

/// A row of the `orders` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub user_id: u64,
    pub total: f64,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Response body for `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeResponse {
    pub message: String,
    /// Routes served by this instance.
    pub endpoints: Vec<String>,
}

/// Response body for `GET /api/users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<User>,
}

/// Response body for `GET /api/orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersResponse {
    pub orders: Vec<Order>,
}

/// Response body for `GET /api/slow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowResponse {
    pub message: String,
    /// Simulated delay in seconds.
    pub delay: f64,
}

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"database_error"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the process is serving.
    pub status: String,
    pub service: String,
    /// Telemetry records dropped because a sink could not keep up.
    pub dropped_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_wire_shape() {
        let o = Order {
            id: 101,
            user_id: 1,
            total: 99.99,
            status: "shipped".into(),
        };
        assert_eq!(
            serde_json::to_value(&o).unwrap(),
            json!({"id": 101, "user_id": 1, "total": 99.99, "status": "shipped"})
        );
    }

    #[test]
    fn users_response_parses() {
        let body = json!({"users": [{"id": 1, "name": "Alice", "email": "alice@example.com"}]});
        let resp: UsersResponse = serde_json::from_value(body).unwrap();
        assert_eq!(resp.users[0].name, "Alice");
    }

    #[test]
    fn error_response_new() {
        let e = ErrorResponse::new("simulated_error", "Simulated error for testing!");
        assert_eq!(e.code, "simulated_error");
        assert!(e.message.contains("Simulated"));
    }
}
