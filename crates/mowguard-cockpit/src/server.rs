//! [`CockpitServer`] – HTTP control surface of the safety core.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`CockpitServer::with_port`]).
//!
//! | Method + path | Handler |
//! |---|---|
//! | `POST /api/control/drive` | [`request_drive`](crate::handlers::request_drive) |
//! | `POST /api/control/blade` | [`request_blade`](crate::handlers::request_blade) |
//! | `POST /api/emergency/stop` | [`emergency_stop`](crate::handlers::emergency_stop) |
//! | `POST /api/emergency/clear` | [`emergency_clear`](crate::handlers::emergency_clear) |
//! | `GET /api/safety/status` | current [`SafetySnapshot`](mowguard_types::SafetySnapshot) |
//! | `GET /api/safety/audit?limit=N` | newest journal transitions |
//! | `GET /api/schema` | JSON Schemas of the snapshot and telemetry envelope |
//! | `GET /health` | liveness |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use mowguard_types::MowError;
use tokio::net::TcpListener;
use tracing::info;

use crate::handlers;
use crate::state::CockpitState;

/// Default TCP port for the control surface.
pub const DEFAULT_PORT: u16 = 8080;

pub struct CockpitServer {
    state: Arc<CockpitState>,
    port: u16,
}

impl CockpitServer {
    /// Create a server on the [`DEFAULT_PORT`].
    pub fn new(state: CockpitState) -> Self {
        Self {
            state: Arc::new(state),
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Port [`run`](Self::run) will bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The route table, without binding a socket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::health))
            .route("/api/control/drive", post(handlers::request_drive))
            .route("/api/control/blade", post(handlers::request_blade))
            .route("/api/emergency/stop", post(handlers::emergency_stop))
            .route("/api/emergency/clear", post(handlers::emergency_clear))
            .route("/api/safety/status", get(handlers::safety_status))
            .route("/api/safety/audit", get(handlers::safety_audit))
            .route("/api/schema", get(handlers::schema))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until the task is dropped.
    ///
    /// # Errors
    ///
    /// [`MowError::Channel`] if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<(), MowError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MowError::Channel(format!("control surface bind error on {addr}: {e}")))?;
        info!(%addr, "control surface listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| MowError::Channel(format!("control surface failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use mowguard_kernel::{BladeAuthorization, BladeCommand, BladeGrant, ControlGate, DriveCommand};
    use mowguard_runtime::{CoreConfig, SafetyCore};
    use mowguard_types::{ReadingValue, SafetyState, SensorReading, Timestamp};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::state::ActuatorSink;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[derive(Default)]
    struct RecordingActuators {
        forwarded: Mutex<Vec<String>>,
    }

    impl RecordingActuators {
        fn forwarded(&self) -> Vec<String> {
            self.forwarded.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    impl ActuatorSink for RecordingActuators {
        fn forward_drive(&self, cmd: &DriveCommand) {
            if let Ok(mut v) = self.forwarded.lock() {
                v.push(format!("drive {} {}", cmd.linear, cmd.angular));
            }
        }

        fn forward_blade(&self, cmd: &BladeCommand) {
            if let Ok(mut v) = self.forwarded.lock() {
                v.push(format!("blade {}", cmd.enable));
            }
        }
    }

    fn setup() -> Result<(SafetyCore, CockpitServer, Arc<RecordingActuators>), Box<dyn std::error::Error>> {
        let core = SafetyCore::start(CoreConfig::default())?;
        let mut auth = BladeAuthorization::new();
        auth.grant(
            "tok",
            BladeGrant {
                operator: "alice".into(),
                allow_while_driving: false,
            },
        );
        let actuators = Arc::new(RecordingActuators::default());
        let state = CockpitState::new(&core, ControlGate::new(auth)).with_actuators(actuators.clone());
        Ok((core, CockpitServer::new(state), actuators))
    }

    async fn call(server: &CockpitServer, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = server.router().oneshot(request).await.expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn default_port_is_8080() -> TestResult {
        let (_core, server, _) = setup()?;
        assert_eq!(server.port(), DEFAULT_PORT);
        assert_eq!(server.with_port(9999).port(), 9999);
        Ok(())
    }

    #[tokio::test]
    async fn health_reports_safety_state() -> TestResult {
        let (_core, server, _) = setup()?;
        let (status, body) = call(&server, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["safety_state"], "NORMAL");
        Ok(())
    }

    #[tokio::test]
    async fn blade_while_stopped_is_rejected() -> TestResult {
        let (core, server, actuators) = setup()?;
        let (status, body) = call(&server, "POST", "/api/emergency/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "EMERGENCY_STOPPED");

        let (status, body) = call(
            &server,
            "POST",
            "/api/control/blade",
            Some(json!({ "enable": true, "token": "tok" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "interlock_violation");
        assert_eq!(body["reason"], "emergency_stop_active");
        assert_eq!(body["blocking"], json!(["emergency_stop_active"]));
        assert!(body["hint"].as_str().is_some_and(|h| !h.is_empty()));
        assert_eq!(core.snapshot().state, SafetyState::EmergencyStopped);
        assert!(actuators.forwarded().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn clear_needs_confirmation() -> TestResult {
        let (core, server, _) = setup()?;
        call(&server, "POST", "/api/emergency/stop", Some(json!({ "reason": "test" }))).await;

        let (status, body) = call(&server, "POST", "/api/emergency/clear", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "confirmation_required");
        assert_eq!(core.snapshot().state, SafetyState::EmergencyStopped);

        let (status, body) = call(
            &server,
            "POST",
            "/api/emergency/clear",
            Some(json!({ "confirmation": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "EMERGENCY_CLEARED");
        assert_eq!(core.snapshot().state, SafetyState::Normal);
        Ok(())
    }

    #[tokio::test]
    async fn drive_is_forwarded_within_caps() -> TestResult {
        let (_core, server, actuators) = setup()?;
        let (status, body) = call(
            &server,
            "POST",
            "/api/control/drive",
            Some(json!({ "linear": 0.5, "angular": 0.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(actuators.forwarded(), vec!["drive 0.5 0"]);

        let (status, body) = call(
            &server,
            "POST",
            "/api/control/drive",
            Some(json!({ "linear": 4.0, "angular": 0.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "speed_cap_exceeded");
        assert_eq!(actuators.forwarded().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn blade_while_driving_needs_permission() -> TestResult {
        let (core, server, actuators) = setup()?;
        let motion = SensorReading::new(
            "sensors/motion/drive",
            Timestamp::now(),
            ReadingValue::Motion {
                drive_active: true,
                blade_active: false,
            },
            1.0,
            "drive_ctl",
        );
        core.bus().publish("sensors/motion/drive", motion)?;

        let (status, body) = call(
            &server,
            "POST",
            "/api/control/blade",
            Some(json!({ "enable": true, "token": "tok" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "drive_active_unauthorized");

        let (status, _) = call(&server, "POST", "/api/control/blade", Some(json!({ "enable": false }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(actuators.forwarded(), vec!["blade false"]);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_is_a_structured_error() -> TestResult {
        let (_core, server, _) = setup()?;
        let request = Request::builder()
            .method("POST")
            .uri("/api/control/drive")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))?;
        let response = server.router().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
        assert_eq!(body["error"], "serialization_error");
        Ok(())
    }

    #[tokio::test]
    async fn status_and_audit_reflect_a_stop() -> TestResult {
        let (_core, server, _) = setup()?;
        call(&server, "POST", "/api/emergency/stop", None).await;

        let (status, body) = call(&server, "GET", "/api/safety/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "EMERGENCY_STOPPED");
        assert_eq!(body["stop"]["source"], "remote_command");

        let mut transitions = Vec::new();
        for _ in 0..50 {
            let (_, body) = call(&server, "GET", "/api/safety/audit?limit=5", None).await;
            transitions = body["transitions"].as_array().cloned().unwrap_or_default();
            if !transitions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0]["to"], "EMERGENCY_STOPPED");
        assert_eq!(transitions[0]["cause"]["kind"], "command");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() -> TestResult {
        let (_core, server, _) = setup()?;
        let request = Request::builder().uri("/api/nope").body(Body::empty())?;
        let response = server.router().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn schema_lists_public_payloads() -> TestResult {
        let (_core, server, _) = setup()?;
        let (status, body) = call(&server, "GET", "/api/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("safety_snapshot").is_some());
        assert!(body.get("telemetry_envelope").is_some());
        Ok(())
    }
}
