//! HTTP server in front of the capture coordinator and the image store.
//!
//! Routes (all under the configured prefix, `/reader` by default):
//!   GET /take             → capture (+ decode), JSON result envelope
//!   GET /view/{filename}  → image bytes
//!   GET /last             → most recently captured image
//!   GET /list             → image names, newest first
//!   GET /clean, /clear    → delete every stored image
//!   GET /health           → health check

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use barcam_common::config::TakeResponse;
use barcam_common::protocol::{HealthResponse, ResultEnvelope};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::coordinator::{Coordinator, Outcome};
use crate::store::{mime_for, ImageStore, StoreError};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: ImageStore,
    pub take_response: TakeResponse,
    pub start_time: Instant,
}

/// Build the router, mounted under `prefix` unless it is empty.
pub fn router(state: AppState, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/take", get(take))
        .route("/view/{filename}", get(view))
        .route("/last", get(last))
        .route("/list", get(list))
        .route("/clean", get(clean))
        .route("/clear", get(clean))
        .route("/health", get(health))
        .with_state(state);

    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };
    app.layer(CorsLayer::permissive())
}

/// Serve until the process is stopped.
pub async fn run(state: AppState, prefix: &str, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(state, prefix);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("REST server listening on {listen_addr}{prefix}");

    axum::serve(listener, app).await?;
    Ok(())
}

// ── errors ───────────────────────────────────────────────────────────────

/// File-serving failures. Capture failures never come through here; they
/// are always a 200 with a failure envelope.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found() -> Self {
        AppError {
            status: StatusCode::NOT_FOUND,
            message: "Not found".into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::not_found(),
            StoreError::InvalidName(_) => AppError {
                status: StatusCode::BAD_REQUEST,
                message: "Bad request".into(),
            },
            other => {
                error!("Image store error: {other}");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            (self.status, Json(ResultEnvelope::failure(self.message))).into_response()
        } else {
            (
                self.status,
                [(header::CONTENT_TYPE, "text/plain")],
                self.message,
            )
                .into_response()
        }
    }
}

// ── route handlers ───────────────────────────────────────────────────────

async fn take(State(state): State<AppState>) -> Response {
    let result = state.coordinator.request().await;

    if state.take_response == TakeResponse::Empty && result.outcome == Outcome::Success {
        return StatusCode::NO_CONTENT.into_response();
    }
    Json(ResultEnvelope::from(result)).into_response()
}

async fn view(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    serve_image(&state.store, &filename).await
}

async fn last(State(state): State<AppState>) -> Result<Response, AppError> {
    match state.store.newest().await? {
        Some(filename) => serve_image(&state.store, &filename).await,
        None => Err(AppError::not_found()),
    }
}

async fn serve_image(store: &ImageStore, filename: &str) -> Result<Response, AppError> {
    let image = store.open(filename).await?;
    let body = Body::from_stream(ReaderStream::new(image.file));

    Ok((
        [
            (header::CONTENT_TYPE, mime_for(&image.name).to_string()),
            (header::CONTENT_LENGTH, image.len.to_string()),
        ],
        body,
    )
        .into_response())
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.store.list_newest_first().await?))
}

async fn clean(State(state): State<AppState>) -> Json<ResultEnvelope> {
    // Never wipe the directory under a capture in flight.
    let _permit = match state.coordinator.exclusive().await {
        Ok(p) => p,
        Err(e) => return Json(ResultEnvelope::failure(e.to_string())),
    };

    match state.store.clear_all().await {
        Ok(removed) => {
            info!("Removed {removed} image(s) from {}", state.store.dir().display());
            Json(ResultEnvelope::success())
        }
        Err(e) => {
            warn!("Clean failed: {e}");
            Json(ResultEnvelope::failure(e.to_string()))
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        state: state.coordinator.state().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path as FsPath;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    use axum::body::to_bytes;
    use axum::http::Request;
    use barcam_common::config::{Admission, FilenameScheme};
    use barcam_common::naming::FileNamer;
    use chrono::Local;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::coordinator::Settings;
    use crate::decoder::{BarcodeDecoder, DecodeOutcome};
    use crate::device::{
        CaptureDevice, CaptureHandle, CaptureTarget, DeviceError, DeviceSignal, SignalSender,
    };

    /// Writes a fixed JPEG-ish payload and reports completion right away.
    #[derive(Default)]
    struct InstantDevice {
        target: Mutex<Option<CaptureTarget>>,
    }

    impl CaptureDevice for InstantDevice {
        fn configure(&self, target: CaptureTarget) {
            *self.target.lock().unwrap() = Some(target);
        }

        fn start(&self, signals: SignalSender) -> Result<CaptureHandle, DeviceError> {
            let target = self
                .target
                .lock()
                .unwrap()
                .take()
                .ok_or(DeviceError::NotConfigured)?;
            std::fs::write(&target.path, b"\xff\xd8\xff\xe0photo").unwrap();
            let token = target.token;
            let at = Local::now();
            let _ = signals.send(DeviceSignal::Started { token, at });
            let _ = signals.send(DeviceSignal::Completed {
                token,
                at,
                filename: target.filename(),
            });
            let _ = signals.send(DeviceSignal::Ended { token, at });
            Ok(CaptureHandle::new(CancellationToken::new(), tokio::spawn(async {})))
        }
    }

    struct FixedDecoder(DecodeOutcome);

    impl BarcodeDecoder for FixedDecoder {
        fn decode(&self, _image: &FsPath) -> DecodeOutcome {
            self.0.clone()
        }
    }

    fn app(dir: &FsPath, decode: Option<DecodeOutcome>, take_response: TakeResponse) -> Router {
        let store = ImageStore::new(dir);
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(InstantDevice::default()),
            decode.map(|o| Arc::new(FixedDecoder(o)) as Arc<dyn BarcodeDecoder>),
            FileNamer::new(FilenameScheme::Random, "TEST"),
            Settings {
                admission: Admission::Queue,
                completion_timeout: Duration::from_secs(2),
                decode_timeout: Duration::from_secs(2),
            },
        );
        let state = AppState {
            coordinator: Arc::new(coordinator),
            store,
            take_response,
            start_time: Instant::now(),
        };
        router(state, "/reader")
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    fn write_with_mtime(dir: &FsPath, name: &str, body: &[u8], mtime: SystemTime) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[tokio::test]
    async fn test_take_then_view_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let found = DecodeOutcome::Found {
            code: "ABC123".into(),
        };
        let app = app(dir.path(), Some(found), TakeResponse::Json);

        let (status, _, body) = get(&app, "/reader/take").await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["result"], "Success");
        assert_eq!(body["code"], "ABC123");
        let filename = body["filename"].as_str().unwrap().to_string();

        let (status, content_type, bytes) = get(&app, &format!("/reader/view/{filename}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(bytes, std::fs::read(dir.path().join(&filename)).unwrap());
    }

    #[tokio::test]
    async fn test_take_failure_is_still_200() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), Some(DecodeOutcome::NotFound), TakeResponse::Json);

        let (status, _, body) = get(&app, "/reader/take").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({ "result": "Failure", "message": "No code detected" })
        );
    }

    #[tokio::test]
    async fn test_take_empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Empty);

        let (status, _, body) = get(&app, "/reader/take").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_view_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Json);

        let (status, content_type, body) = get(&app, "/reader/view/does-not-exist.jpg").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(content_type.as_deref(), Some("text/plain"));
        assert_eq!(body, b"Not found");
    }

    #[tokio::test]
    async fn test_view_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Json);

        let (status, _, _) = get(&app, "/reader/view/..%2Fsecret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_last_and_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write_with_mtime(dir.path(), "one.jpg", b"1", t1);
        write_with_mtime(dir.path(), "three.png", b"3", t1 + Duration::from_secs(120));
        write_with_mtime(dir.path(), "two.jpg", b"2", t1 + Duration::from_secs(60));
        let app = app(dir.path(), None, TakeResponse::Json);

        let (status, content_type, body) = get(&app, "/reader/last").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/png"));
        assert_eq!(body, b"3");

        let (_, _, body) = get(&app, "/reader/list").await;
        assert_eq!(
            json(&body),
            serde_json::json!(["three.png", "two.jpg", "one.jpg"])
        );
    }

    #[tokio::test]
    async fn test_last_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Json);

        let (status, _, body) = get(&app, "/reader/last").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Not found");
    }

    #[tokio::test]
    async fn test_list_unreadable_dir_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir.path().join("gone"), None, TakeResponse::Json);

        let (status, _, body) = get(&app, "/reader/list").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json(&body)["result"], "Failure");
    }

    #[tokio::test]
    async fn test_clean_twice() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Json);
        get(&app, "/reader/take").await;
        get(&app, "/reader/take").await;

        for uri in ["/reader/clean", "/reader/clear"] {
            let (status, _, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json(&body), serde_json::json!({ "result": "Success" }));
        }
        let (_, _, body) = get(&app, "/reader/list").await;
        assert_eq!(json(&body), serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_health_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), None, TakeResponse::Json);

        let (status, _, body) = get(&app, "/reader/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["state"], "idle");

        let (status, _, _) = get(&app, "/take").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
