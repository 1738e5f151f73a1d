use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::daemon::Context;
use crate::daemon::DeviceUpdate;
use crate::daemon::ScanOutcome;
use crate::device::Device;
use crate::device::DeviceStatus;
use crate::events::InboundEvent;
use crate::router::DeliveryError;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    devices: usize,
}

/// One entry of GET /v1/devices
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DeviceView {
    id: String,
    name: String,
    enabled: bool,
    event: String,
    online: bool,
    status: String,
}

impl From<&Device> for DeviceView {
    fn from(device: &Device) -> Self {
        let status: DeviceStatus = device.status();
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            enabled: device.enabled,
            event: device.event.clone(),
            online: device.online,
            status: status.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BeepRequest {
    intensity: Option<f32>,
}

#[derive(Serialize)]
struct BeepResponse {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    value: f32,
}

#[derive(Serialize)]
struct EventResponse {
    /// An earlier event was still pending and got discarded
    replaced: bool,
}

#[derive(Serialize)]
struct ConsoleResponse {
    lines: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("device {0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::UnknownDevice(id) => ApiError::NotFound(id),
            DeliveryError::Offline(_) => ApiError::Conflict(e.to_string()),
            DeliveryError::Transport(_) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        tracing::debug!("API error: {}", self);
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared application state
struct AppState {
    version: &'static str,
    ctx: Arc<Context>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            devices: state.ctx.registry.count(),
        }),
    )
}

/// Handler for GET /v1/devices
#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceView>> {
    let devices = state.ctx.registry.all();
    Json(devices.iter().map(DeviceView::from).collect())
}

/// Handler for PATCH /v1/devices/:id
#[tracing::instrument(skip(state))]
async fn update_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<DeviceUpdate>,
) -> Result<Json<DeviceView>, ApiError> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let device = state
        .ctx
        .update_device(&id, &update)
        .ok_or(ApiError::NotFound(id))?;
    Ok(Json(DeviceView::from(&device)))
}

/// Handler for DELETE /v1/devices/:id
#[tracing::instrument(skip(state))]
async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.ctx.remove_device(&id).await;
    StatusCode::NO_CONTENT
}

/// Handler for POST /v1/devices/:id/beep
#[tracing::instrument(skip(state, body))]
async fn beep(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<BeepRequest>>,
) -> Result<Json<BeepResponse>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let intensity = request.intensity.unwrap_or(1.0);
    if !intensity.is_finite() {
        return Err(ApiError::BadRequest("intensity must be a number".to_string()));
    }

    let payload = state.ctx.router.beep(&id, intensity).await?;
    Ok(Json(BeepResponse { payload }))
}

/// Handler for POST /v1/events/:name
#[tracing::instrument(skip(state))]
async fn inject_event(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    if !request.value.is_finite() {
        return Err(ApiError::BadRequest("value must be a number".to_string()));
    }

    let replaced = state
        .ctx
        .events
        .send(InboundEvent::new(name, request.value));
    Ok((StatusCode::ACCEPTED, Json(EventResponse { replaced })))
}

/// Handler for POST /v1/scan
#[tracing::instrument(skip(state))]
async fn scan(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ScanOutcome>) {
    let outcome = state.ctx.scan_and_adopt().await;
    let status = match outcome {
        ScanOutcome::Busy => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (status, Json(outcome))
}

/// Handler for GET /v1/console
#[tracing::instrument(skip(state))]
async fn console(State(state): State<Arc<AppState>>) -> Json<ConsoleResponse> {
    Json(ConsoleResponse {
        lines: state.ctx.recent.lines(),
    })
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:id", patch(update_device).delete(remove_device))
        .route("/v1/devices/:id/beep", post(beep))
        .route("/v1/events/:name", post(inject_event))
        .route("/v1/scan", post(scan))
        .route("/v1/console", get(console))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    ctx: Arc<Context>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, ctx });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::console::RecordingConsole;
    use crate::daemon::Daemon;
    use crate::transport::Handle;
    use crate::transport::sim::SimTransport;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    struct Harness {
        _dir: TempDir,
        sim: SimTransport,
        ctx: Arc<Context>,
        app: Router,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.storage.devices_path = dir.path().join("devices.json");

            let sim = SimTransport::new();
            let daemon = Daemon::new(
                &config,
                Arc::new(sim.clone()),
                Arc::new(sim.clone()),
                Arc::new(RecordingConsole::default()),
            );
            let ctx = daemon.context();
            let app = create_router(Arc::new(AppState {
                version: "test",
                ctx: ctx.clone(),
            }));

            Self {
                _dir: dir,
                sim,
                ctx,
                app,
            }
        }

        async fn online_device(&self, id: &str, name: &str) {
            self.sim.add_peripheral(id, "TouchyTails");
            self.ctx.registry.add(Device::new(id, name));
            let handle = Handle::open(&self.sim, id, Duration::from_secs(10))
                .await
                .unwrap();
            self.ctx.registry.set_transport(id, handle);
            self.ctx.registry.set_online(id, true);
        }

        async fn request(&self, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => builder.body(Body::empty()),
            }
            .unwrap();

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, String::from_utf8(bytes.to_vec()).unwrap())
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let h = Harness::new();
        let (status, body) = h.request("GET", "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_info() {
        let h = Harness::new();
        let (status, body) = h.request("GET", "/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);

        let info: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(info["version"], "test");
        assert_eq!(info["devices"], 0);
        assert!(info["hostname"].is_string());
    }

    #[tokio::test]
    async fn test_list_devices() {
        let h = Harness::new();
        h.online_device(ADDR, "Device A").await;
        h.ctx
            .registry
            .add(Device::new("AA:BB:CC:DD:EE:02", "Device B").with_enabled(false));

        let (status, body) = h.request("GET", "/v1/devices", None).await;
        assert_eq!(status, StatusCode::OK);

        let devices: Vec<DeviceView> = serde_json::from_str(&body).unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceView {
                    id: ADDR.to_string(),
                    name: "Device A".to_string(),
                    enabled: true,
                    event: String::new(),
                    online: true,
                    status: "Online".to_string(),
                },
                DeviceView {
                    id: "AA:BB:CC:DD:EE:02".to_string(),
                    name: "Device B".to_string(),
                    enabled: false,
                    event: String::new(),
                    online: false,
                    status: "Disabled".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_update_device() {
        let h = Harness::new();
        h.ctx.registry.add(Device::new(ADDR, "Device A"));

        let (status, body) = h
            .request(
                "PATCH",
                &format!("/v1/devices/{}", ADDR),
                Some(r#"{"name": "Left ear", "event": "Touch"}"#),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let view: DeviceView = serde_json::from_str(&body).unwrap();
        assert_eq!(view.name, "Left ear");
        assert_eq!(view.event, "Touch");

        let (status, _) = h
            .request("PATCH", &format!("/v1/devices/{}", ADDR), Some(r#"{"name": " "}"#))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h
            .request("PATCH", "/v1/devices/AA:BB:CC:DD:EE:09", Some("{}"))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"device AA:BB:CC:DD:EE:09 not found"}"#);
    }

    #[tokio::test]
    async fn test_remove_device_is_idempotent() {
        let h = Harness::new();
        h.online_device(ADDR, "Device A").await;

        for _ in 0..2 {
            let (status, _) = h
                .request("DELETE", &format!("/v1/devices/{}", ADDR), None)
                .await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
        assert!(!h.ctx.registry.exists(ADDR));
        assert_eq!(h.sim.live_connections(ADDR), 0);
    }

    #[tokio::test]
    async fn test_beep() {
        let h = Harness::new();
        h.online_device(ADDR, "Device A").await;
        h.ctx.registry.add(Device::new("AA:BB:CC:DD:EE:02", "Device B"));

        let (status, body) = h
            .request("POST", &format!("/v1/devices/{}/beep", ADDR), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"payload":"1.00"}"#);

        let (status, body) = h
            .request(
                "POST",
                &format!("/v1/devices/{}/beep", ADDR),
                Some(r#"{"intensity": 0.5}"#),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"payload":"0.70"}"#);
        assert_eq!(h.sim.writes(ADDR), vec!["1.00", "0.70"]);

        let (status, _) = h
            .request("POST", "/v1/devices/AA:BB:CC:DD:EE:02/beep", None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_inject_event_replaces_pending() {
        let h = Harness::new();

        let (status, body) = h
            .request("POST", "/v1/events/Touch", Some(r#"{"value": 0.3}"#))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, r#"{"replaced":false}"#);

        let (_, body) = h
            .request("POST", "/v1/events/Touch", Some(r#"{"value": 0.9}"#))
            .await;
        assert_eq!(body, r#"{"replaced":true}"#);

        let (status, _) = h
            .request("POST", "/v1/events/Touch", Some(r#"{"value": "high"}"#))
            .await;
        assert!(status.is_client_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan() {
        let h = Harness::new();
        h.sim.add_peripheral(ADDR, "TouchyTails");

        let (status, body) = h.request("POST", "/v1/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            format!(r#"{{"outcome":"added","id":"{}","name":"Device A"}}"#, ADDR)
        );

        let (_, body) = h.request("GET", "/v1/console", None).await;
        let console: serde_json::Value = serde_json::from_str(&body).unwrap();
        let lines = console["lines"].as_array().unwrap();
        assert!(lines.iter().any(|l| l == &format!("Added Device A ({})", ADDR)));
    }
}
