//! HTTP endpoints of the voucher engine.
//!
//! - `POST /sessions` registers a purchase intent and returns `{sessionId, reference}`.
//! - `POST /confirmations` ingests a payment notification. It is always acknowledged,
//!   whatever the reconciliation outcome.
//! - `GET /vouchers/{session_id}` polls for the voucher issued to a session.
//! - `GET /health` reports liveness and the device connection state.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::engine::{Engine, SessionError};
use crate::notification::Confirmation;
use crate::session::{Reference, SessionId};
use crate::voucher::Voucher;

pub fn routes() -> Router<Arc<Engine>> {
    Router::new()
        .route("/sessions", post(post_session))
        .route("/confirmations", post(post_confirmation))
        .route("/vouchers/{session_id}", get(get_voucher))
        .route("/health", get(get_health))
}

/// Intake body. Every field is optional at the wire level so that a missing one is a
/// validation error rather than a deserialization failure.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub phone: Option<String>,
    pub amount: Option<serde_json::Number>,
    pub offer: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub reference: Reference,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoucherResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher: Option<Voucher>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// `POST /sessions`: creates a `Pending` purchase session.
#[instrument(skip_all)]
pub async fn post_session(
    State(engine): State<Arc<Engine>>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Malformed intake body");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: rejection.body_text(),
                }),
            )
                .into_response();
        }
    };
    let phone = match body.phone {
        Some(phone) => phone,
        None => return SessionError::MissingField("phone").into_response(),
    };
    let amount = match body.amount {
        Some(amount) => match amount.as_u64() {
            Some(amount) => amount,
            None => return SessionError::InvalidAmount.into_response(),
        },
        None => return SessionError::MissingField("amount").into_response(),
    };
    let offer = match body.offer {
        Some(offer) => offer,
        None => return SessionError::MissingField("offer").into_response(),
    };
    match engine.create_session(&phone, amount, &offer).await {
        Ok((session_id, reference)) => (
            StatusCode::CREATED,
            Json(CreateSessionResponse {
                session_id,
                reference,
            }),
        )
            .into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /confirmations`: reconciles a payment notification.
///
/// The body is accepted in any shape; anything that is not a `{sender, message}` object
/// is acknowledged and dropped like any other unusable notification.
#[instrument(skip_all)]
pub async fn post_confirmation(
    State(engine): State<Arc<Engine>>,
    body: Result<Json<Confirmation>, JsonRejection>,
) -> impl IntoResponse {
    match body {
        Ok(Json(confirmation)) => {
            let outcome = engine.ingest_confirmation(&confirmation).await;
            tracing::debug!(?outcome, "Confirmation processed");
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Malformed confirmation body");
        }
    }
    (StatusCode::OK, Json(json!({ "acknowledged": true })))
}

/// `GET /vouchers/{session_id}`: the voucher issued for a session, if any.
#[instrument(skip_all)]
pub async fn get_voucher(
    State(engine): State<Arc<Engine>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let voucher = engine.get_voucher(&SessionId::from(session_id));
    tracing::debug!(found = voucher.is_some(), "Voucher lookup");
    Json(VoucherResponse {
        found: voucher.is_some(),
        voucher,
    })
}

#[instrument(skip_all)]
pub async fn get_health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let device = engine.device_state().await;
    Json(json!({ "status": "ok", "device": device.to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::device::testing::{ScriptedConnector, Step};
    use crate::engine::tests::engine;
    use axum::body::Body;
    use axum::http::{Request, header};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(connector: &ScriptedConnector) -> Router {
        routes().with_state(Arc::new(engine(connector)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_purchase_flow() {
        let app = app(&ScriptedConnector::default());
        let (status, created) = send(
            &app,
            "POST",
            "/sessions",
            Some(json!({ "phone": "032 12 345 67", "amount": 1000, "offer": "1h" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = created["sessionId"].as_str().unwrap().to_string();
        assert_eq!(created["reference"].as_str().unwrap().len(), 6);

        let uri = format!("/vouchers/{session_id}");
        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "found": false }));

        let (status, body) = send(
            &app,
            "POST",
            "/confirmations",
            Some(json!({ "sender": "MVOLA", "message": "Vous avez recu 1000 Ar de (0321234567)" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "acknowledged": true }));

        let (_, first) = send(&app, "GET", &uri, None).await;
        assert_eq!(first["found"], json!(true));
        assert!(first["voucher"]["username"].is_string());
        assert!(first["voucher"]["password"].is_string());
        let (_, second) = send(&app, "GET", &uri, None).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_intake_is_bad_request() {
        let app = app(&ScriptedConnector::default());
        for body in [
            json!({ "amount": 1000, "offer": "1h" }),
            json!({ "phone": "0321234567", "offer": "1h" }),
            json!({ "phone": "0321234567", "amount": 1000 }),
            json!({ "phone": "0321234567", "amount": 1000, "offer": "1y" }),
            json!({ "phone": "0321234567", "amount": -5, "offer": "1h" }),
            json!({ "phone": "0321234567", "amount": 10.5, "offer": "1h" }),
            json!({ "phone": "0321234567", "amount": 0, "offer": "1h" }),
            json!(["not", "an", "object"]),
        ] {
            let (status, response) = send(&app, "POST", "/sessions", Some(body.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert!(response["error"].is_string(), "{body}");
        }
    }

    #[tokio::test]
    async fn test_confirmations_are_always_acknowledged() {
        let connector = ScriptedConnector::default();
        connector.0.connects([
            Step::Fail(DeviceError::Transport("connection refused".into())),
            Step::Fail(DeviceError::Transport("connection refused".into())),
        ]);
        let app = app(&connector);
        send(
            &app,
            "POST",
            "/sessions",
            Some(json!({ "phone": "0321234567", "amount": 1000, "offer": "1h" })),
        )
        .await;
        for body in [
            json!({ "sender": "MVOLA", "message": "Vous avez recu 1000 Ar de (0321234567)" }),
            json!({ "sender": "MVOLA", "message": "gibberish" }),
            json!({ "sender": "someone", "message": "1000 Ar (0321234567)" }),
            json!({ "unexpected": true }),
        ] {
            let (status, response) = send(&app, "POST", "/confirmations", Some(body)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(response, json!({ "acknowledged": true }));
        }
    }

    #[tokio::test]
    async fn test_unknown_voucher_is_not_found() {
        let app = app(&ScriptedConnector::default());
        let (status, body) = send(&app, "GET", "/vouchers/does-not-exist", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "found": false }));
    }

    #[tokio::test]
    async fn test_health_reports_device_state() {
        let app = app(&ScriptedConnector::default());
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "device": "disconnected" }));
    }
}
