//! REST endpoints for requests and consent, mounted under `/api/v0`.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::Error;
use crate::requests::RequestStatus;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub started: Instant,
}

/// Build the Axum router with all broker routes.
pub fn routes(broker: Arc<Broker>) -> Router {
    let state = AppState {
        broker,
        started: Instant::now(),
    };

    Router::new()
        .route("/api/v0/health", get(health))
        .route("/api/v0/create", post(create_request))
        .route(
            "/api/v0/smsrequest",
            get(get_request).patch(update_request_status),
        )
        .route("/api/v0/ready", get(earliest_ready))
        .route("/api/v0/optin", get(get_optin).patch(toggle_optin))
        .route("/api/v0/optin/ready", get(earliest_to_ask))
        .route("/api/v0/optin/asked", post(mark_asked))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PipelineClosed => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Entropy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(raw).map_err(|_| Error::InvalidArgument(format!("invalid id {raw:?}")))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "sms-broker",
        "uptime_secs": state.started.elapsed().as_secs(),
        "outstanding_filters": state.broker.outstanding_filters(),
    }))
}

// ── SMS requests ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateBody {
    from_number: String,
    to_number: String,
    message: String,
}

async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, Error> {
    let request = state
        .broker
        .create_request(&body.from_number, &body.to_number, &body.message)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"message": "SMS request created", "smsrequest": request})),
    ))
}

#[derive(Deserialize)]
struct IdQuery {
    id: String,
}

async fn get_request(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<impl IntoResponse, Error> {
    let request = state.broker.get_request(parse_id(&query.id)?).await?;
    Ok(Json(json!({"message": "SMS request found", "smsrequest": request})))
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

async fn update_request_status(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, Error> {
    let id = parse_id(&query.id)?;
    let status: RequestStatus = body.status.parse()?;
    let request = state.broker.update_request_status(id, status).await?;
    Ok(Json(json!({"message": "SMS request updated", "smsrequest": request})))
}

async fn earliest_ready(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let request = state.broker.earliest_ready_to_send().await?;
    Ok(Json(json!({"message": "SMS request ready to send", "smsrequest": request})))
}

// ── Consent ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NumberQuery {
    number: String,
}

async fn get_optin(
    State(state): State<AppState>,
    Query(query): Query<NumberQuery>,
) -> Result<impl IntoResponse, Error> {
    let optin = state.broker.get_optin(&query.number).await?;
    Ok(Json(json!({"message": "Opt-in found", "optin": optin})))
}

async fn earliest_to_ask(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let optin = state.broker.earliest_to_ask().await?;
    Ok(Json(json!({"message": "Opt-in awaiting question", "optin": optin})))
}

#[derive(Deserialize)]
struct NumberBody {
    number: String,
}

async fn mark_asked(
    State(state): State<AppState>,
    Json(body): Json<NumberBody>,
) -> Result<impl IntoResponse, Error> {
    let optin = state.broker.mark_asked(&body.number).await?;
    Ok(Json(json!({"message": "Opt-in marked as asked", "optin": optin})))
}

#[derive(Deserialize)]
struct ReplyBody {
    number: String,
    reply: String,
}

async fn toggle_optin(
    State(state): State<AppState>,
    Json(body): Json<ReplyBody>,
) -> Result<impl IntoResponse, Error> {
    let outcome = state.broker.toggle_consent(&body.number, &body.reply).await?;
    let message = if outcome.changed() {
        "Consent updated"
    } else {
        "Reply did not match codeword"
    };
    Ok(Json(json!({
        "message": message,
        "matched": outcome.matched,
        "optin": outcome.optin,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::FilterConfig;
    use crate::error::{DatabaseError, FilterError};
    use crate::pipeline::{ModerationClient, ModerationVerdict};
    use crate::store::{Database, LibSqlBackend};

    struct PassClient;

    #[async_trait]
    impl ModerationClient for PassClient {
        async fn classify(&self, _message: &str) -> Result<ModerationVerdict, FilterError> {
            Ok(ModerationVerdict::default())
        }
    }

    async fn app() -> Router {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let broker = Broker::with_client(db, Arc::new(PassClient), &FilterConfig::default());
        routes(Arc::new(broker))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (Error::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (Error::not_found("optin", "x"), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (
                Error::Storage(DatabaseError::Query("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (Error::Entropy("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::PipelineClosed, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn create_then_fetch() {
        let app = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/v0/create",
            Some(json!({"from_number": "555-123-4567", "to_number": "555-987-6543", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["smsrequest"]["status"], "verify_check");

        let id = body["smsrequest"]["id"].as_str().unwrap().to_string();
        let (status, body) = call(&app, "GET", &format!("/api/v0/smsrequest?id={id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["smsrequest"]["message"], "hi");
    }

    #[tokio::test]
    async fn bad_input_is_400() {
        let app = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/v0/create",
            Some(json!({"from_number": "nope", "to_number": "555-987-6543", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("phone"));

        let (status, _) = call(&app, "GET", "/api/v0/smsrequest?id=not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_status_is_400_and_unknown_id_is_404() {
        let app = app().await;
        let (_, body) = call(
            &app,
            "POST",
            "/api/v0/create",
            Some(json!({"from_number": "555-123-4567", "to_number": "555-987-6543", "message": "hi"})),
        )
        .await;
        let id = body["smsrequest"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/api/v0/smsrequest?id={id}"),
            Some(json!({"status": "delivered"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "PATCH",
            &format!("/api/v0/smsrequest?id={id}"),
            Some(json!({"status": "taken"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["smsrequest"]["status"], "taken");

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/api/v0/smsrequest?id={}", Uuid::new_v4()),
            Some(json!({"status": "sent"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/v0/ready", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/api/v0/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
