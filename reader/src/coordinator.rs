//! Capture coordination – turns one `take` request into one camera capture,
//! an optional barcode decode, and exactly one [`CaptureResult`].
//!
//! Lifecycle per request: `Idle → Armed → AwaitingCapture → (Decoding) →
//! Resolved`. A one-permit semaphore guards the whole lifecycle, so the
//! camera never sees two output targets at once. The capture itself runs
//! in its own task that owns the permit; the caller only waits on a
//! one-shot [`ResultSlot`], so a caller that goes away does not abort a
//! capture half way.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use barcam_common::config::Admission;
use barcam_common::naming::FileNamer;
use barcam_common::protocol::ResultEnvelope;
use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::decoder::{BarcodeDecoder, DecodeOutcome};
use crate::device::{CaptureDevice, CaptureTarget, DeviceError, DeviceSignal};
use crate::store::ImageStore;

pub const NO_CODE_DETECTED: &str = "No code detected";
const DECODE_TIMED_OUT: &str = "decode timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    AwaitingCapture,
    Decoding,
    Resolved,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::AwaitingCapture => "awaiting-capture",
            Self::Decoding => "decoding",
            Self::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NotDetected,
    Failure,
}

/// Final answer for one capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub outcome: Outcome,
    pub filename: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl CaptureResult {
    pub fn success(filename: String, code: Option<String>) -> Self {
        CaptureResult {
            outcome: Outcome::Success,
            filename: Some(filename),
            code,
            message: None,
        }
    }

    pub fn not_detected(filename: String) -> Self {
        CaptureResult {
            outcome: Outcome::NotDetected,
            filename: Some(filename),
            code: None,
            message: Some(NO_CODE_DETECTED.to_string()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        CaptureResult {
            outcome: Outcome::Failure,
            filename: None,
            code: None,
            message: Some(message.into()),
        }
    }
}

impl From<CaptureResult> for ResultEnvelope {
    fn from(r: CaptureResult) -> Self {
        match r.outcome {
            Outcome::Success => ResultEnvelope {
                filename: r.filename,
                code: r.code,
                ..ResultEnvelope::success()
            },
            Outcome::NotDetected => ResultEnvelope::failure(NO_CODE_DETECTED),
            Outcome::Failure => {
                ResultEnvelope::failure(r.message.unwrap_or_else(|| "capture failed".into()))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture already in progress")]
    Busy,
    #[error("capture gate closed")]
    GateClosed,
    #[error("capture timed out")]
    TimedOut,
    #[error("capture ended without an image")]
    NoImage,
    #[error("camera signal stream closed")]
    DeviceGone,
    #[error("camera error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("result already resolved")]
    AlreadyResolved,
    #[error("requester is gone")]
    ReceiverGone,
}

/// Single-use result channel between a capture task and its requester.
#[derive(Debug)]
pub struct ResultSlot {
    tx: Option<oneshot::Sender<CaptureResult>>,
}

impl ResultSlot {
    pub fn new() -> (Self, oneshot::Receiver<CaptureResult>) {
        let (tx, rx) = oneshot::channel();
        (ResultSlot { tx: Some(tx) }, rx)
    }

    /// Deliver the result. Only the first call can succeed.
    pub fn resolve(&mut self, result: CaptureResult) -> Result<(), SlotError> {
        let tx = self.tx.take().ok_or(SlotError::AlreadyResolved)?;
        tx.send(result).map_err(|_| SlotError::ReceiverGone)
    }
}

/// One pending `take`.
#[derive(Debug)]
pub struct CaptureRequest {
    pub token: u64,
    pub filename: String,
    pub created: DateTime<Local>,
    slot: ResultSlot,
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub admission: Admission,
    /// How long to wait for the camera's Completed signal.
    pub completion_timeout: Duration,
    /// How long a single decode may take.
    pub decode_timeout: Duration,
}

pub struct Coordinator {
    store: ImageStore,
    device: Arc<dyn CaptureDevice>,
    /// `None` runs captures without decoding.
    decoder: Option<Arc<dyn BarcodeDecoder>>,
    namer: FileNamer,
    settings: Settings,
    gate: Arc<Semaphore>,
    next_token: AtomicU64,
    state: watch::Sender<CaptureState>,
}

impl Coordinator {
    pub fn new(
        store: ImageStore,
        device: Arc<dyn CaptureDevice>,
        decoder: Option<Arc<dyn BarcodeDecoder>>,
        namer: FileNamer,
        settings: Settings,
    ) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        Coordinator {
            store,
            device,
            decoder,
            namer,
            settings,
            gate: Arc::new(Semaphore::new(1)),
            next_token: AtomicU64::new(1),
            state,
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Hold the capture gate, e.g. while the image directory is wiped.
    pub async fn exclusive(&self) -> Result<SemaphorePermit<'_>, CaptureError> {
        self.gate.acquire().await.map_err(|_| CaptureError::GateClosed)
    }

    /// Take one photo (and decode it when enabled).
    ///
    /// Dropping the returned future before it completes leaves an admitted
    /// capture running to the end; only its answer is discarded.
    pub async fn request(self: &Arc<Self>) -> CaptureResult {
        let permit = match self.admit().await {
            Ok(p) => p,
            Err(e) => {
                info!("Photo take refused: {e}");
                return CaptureResult::failure(e.to_string());
            }
        };

        let (request, rx) = self.new_request();
        info!(
            "Photo take requested (token={}, filename={})",
            request.token, request.filename
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.run(request).await;
        });

        rx.await
            .unwrap_or_else(|_| CaptureResult::failure("capture task ended without a result"))
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, CaptureError> {
        match self.settings.admission {
            Admission::Queue => Arc::clone(&self.gate)
                .acquire_owned()
                .await
                .map_err(|_| CaptureError::GateClosed),
            Admission::Reject => Arc::clone(&self.gate)
                .try_acquire_owned()
                .map_err(|_| CaptureError::Busy),
        }
    }

    fn new_request(&self) -> (CaptureRequest, oneshot::Receiver<CaptureResult>) {
        let (slot, rx) = ResultSlot::new();
        let request = CaptureRequest {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            filename: self.namer.next_name(),
            created: Local::now(),
            slot,
        };
        (request, rx)
    }

    /// Drive one admitted request to resolution. Caller holds the gate.
    async fn run(&self, mut request: CaptureRequest) {
        let result = match self.capture(&request).await {
            Ok(filename) => self.finish(filename).await,
            Err(e) => {
                warn!("Capture {} failed: {e}", request.token);
                CaptureResult::failure(e.to_string())
            }
        };

        self.set_state(CaptureState::Resolved);
        let elapsed = Local::now() - request.created;
        info!(
            "Capture {} resolved as {:?} in {}ms",
            request.token,
            result.outcome,
            elapsed.num_milliseconds()
        );

        match request.slot.resolve(result) {
            Ok(()) => {}
            Err(SlotError::ReceiverGone) => {
                debug!("Requester of capture {} left, response skipped", request.token)
            }
            Err(e) => error!("Capture {}: {e}", request.token),
        }
        self.set_state(CaptureState::Idle);
    }

    /// Arm the device, fire it and wait for this request's image.
    async fn capture(&self, request: &CaptureRequest) -> Result<String, CaptureError> {
        let target = CaptureTarget {
            token: request.token,
            path: self.store.save_target(&request.filename),
        };
        self.device.configure(target);
        self.set_state(CaptureState::Armed);

        // Listener exists before the device can emit anything.
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.set_state(CaptureState::AwaitingCapture);
        let handle = self.device.start(tx)?;

        let completion = tokio::time::timeout(
            self.settings.completion_timeout,
            wait_for_completion(request.token, &mut rx),
        )
        .await
        .unwrap_or(Err(CaptureError::TimedOut));

        // The camera is released before the gate is, so a timed-out capture
        // can neither overlap the next one nor write after a clean.
        handle.abort().await;
        completion
    }

    async fn finish(&self, filename: String) -> CaptureResult {
        let Some(decoder) = self.decoder.clone() else {
            return CaptureResult::success(filename, None);
        };

        self.set_state(CaptureState::Decoding);
        let path: PathBuf = self.store.save_target(&filename);
        let decoding = tokio::task::spawn_blocking(move || decoder.decode(&path));
        let outcome = match tokio::time::timeout(self.settings.decode_timeout, decoding).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => DecodeOutcome::Error {
                reason: format!("decoder task failed: {e}"),
            },
            Err(_) => DecodeOutcome::Error {
                reason: DECODE_TIMED_OUT.to_string(),
            },
        };

        match outcome {
            DecodeOutcome::Found { code } => {
                info!("Code detected in {filename}: {code}");
                CaptureResult::success(filename, Some(code))
            }
            DecodeOutcome::NotFound => {
                info!("No code detected in {filename}");
                CaptureResult::not_detected(filename)
            }
            DecodeOutcome::Error { reason } => {
                warn!("Decoding {filename} failed: {reason}");
                CaptureResult::failure(reason)
            }
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state.send_replace(state);
    }
}

/// Read signals until this capture's Completed arrives. Anything after it
/// is never read, so duplicates cannot resolve twice.
async fn wait_for_completion(
    token: u64,
    rx: &mut mpsc::UnboundedReceiver<DeviceSignal>,
) -> Result<String, CaptureError> {
    while let Some(signal) = rx.recv().await {
        if signal.token() != token {
            warn!(
                "Ignoring signal for capture {} while waiting for {token}",
                signal.token()
            );
            continue;
        }
        match signal {
            DeviceSignal::Started { at, .. } => debug!("Photo take started at {at}"),
            DeviceSignal::Completed { filename, at, .. } => {
                debug!("Photo take completed at {at}. File: {filename}");
                return Ok(filename);
            }
            DeviceSignal::Ended { .. } => return Err(CaptureError::NoImage),
        }
    }
    Err(CaptureError::DeviceGone)
}
