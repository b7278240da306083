//! Camera adapter – drives a still-capture program (`raspistill`,
//! `libcamera-still`, ...) as a child process and reports its progress as
//! [`DeviceSignal`]s.
//!
//! Each capture is tied to a [`CaptureTarget`] whose token travels with
//! every signal, so a listener can tell its own capture from a stray one.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-capture signal channel handed to [`CaptureDevice::start`].
pub type SignalSender = mpsc::UnboundedSender<DeviceSignal>;

/// Progress of one capture. Always Started → Completed → Ended, with
/// Completed missing when no image was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSignal {
    Started {
        token: u64,
        at: DateTime<Local>,
    },
    Completed {
        token: u64,
        at: DateTime<Local>,
        filename: String,
    },
    Ended {
        token: u64,
        at: DateTime<Local>,
    },
}

impl DeviceSignal {
    pub fn token(&self) -> u64 {
        match self {
            Self::Started { token, .. }
            | Self::Completed { token, .. }
            | Self::Ended { token, .. } => *token,
        }
    }
}

/// Where the next capture goes and which request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub token: u64,
    pub path: PathBuf,
}

impl CaptureTarget {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("capture target not configured")]
    NotConfigured,
    #[error("cannot start {program}: {source}")]
    Spawn { program: String, source: io::Error },
}

/// A running capture. The device owns the camera until the task behind
/// this handle has finished.
#[derive(Debug)]
pub struct CaptureHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        CaptureHandle { cancel, task }
    }

    /// Stop the capture if it is still running and wait until the device
    /// has let go of the camera. A capture that already finished is left
    /// as it is.
    pub async fn abort(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Capture task failed: {e}");
        }
    }
}

/// A camera that takes one still at a time.
///
/// `configure` and `start` are a pair; callers serialize them.
pub trait CaptureDevice: Send + Sync {
    /// Set the output of the next capture.
    fn configure(&self, target: CaptureTarget);

    /// Fire the configured capture and return immediately. Signals for it
    /// arrive on `signals`. A cancelled capture leaves no image behind.
    fn start(&self, signals: SignalSender) -> Result<CaptureHandle, DeviceError>;
}

/// Runs `<program> -n -e jpg -t <ms> -o <path> [extra...]` per capture.
#[derive(Debug)]
pub struct StillCommandDevice {
    program: String,
    timeout_ms: u64,
    extra_args: Vec<String>,
    target: Mutex<Option<CaptureTarget>>,
}

impl StillCommandDevice {
    pub fn new(program: impl Into<String>, timeout_ms: u64, extra_args: Vec<String>) -> Self {
        StillCommandDevice {
            program: program.into(),
            timeout_ms,
            extra_args,
            target: Mutex::new(None),
        }
    }

    pub fn args(&self, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            "-e".to_string(),
            "jpg".to_string(),
            "-t".to_string(),
            self.timeout_ms.to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn take_target(&self) -> Option<CaptureTarget> {
        self.target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl CaptureDevice for StillCommandDevice {
    fn configure(&self, target: CaptureTarget) {
        debug!("Capture output set to {}", target.path.display());
        *self
            .target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(target);
    }

    fn start(&self, signals: SignalSender) -> Result<CaptureHandle, DeviceError> {
        let target = self.take_target().ok_or(DeviceError::NotConfigured)?;
        let args = self.args(&target.path);

        info!("Spawning: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let token = target.token;
        let _ = signals.send(DeviceSignal::Started {
            token,
            at: Local::now(),
        });

        // Drain stderr so camera errors show up in our log and the pipe
        // never fills.
        if let Some(stderr) = child.stderr.take() {
            let program = self.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!("[{program}] {line}");
                    }
                }
            });
        }

        let program = self.program.clone();
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let task = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancelled.cancelled() => None,
                _ = signals.closed() => None,
            };

            match status {
                None => {
                    warn!("Stopping {program} for capture {token}");
                    if let Err(e) = child.kill().await {
                        warn!("Cannot kill {program}: {e}");
                    }
                    match tokio::fs::remove_file(&target.path).await {
                        Ok(()) => debug!("Removed partial {}", target.path.display()),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => warn!("Cannot remove {}: {e}", target.path.display()),
                    }
                }
                Some(Ok(status)) if status.success() => {
                    if tokio::fs::metadata(&target.path).await.is_ok() {
                        let _ = signals.send(DeviceSignal::Completed {
                            token,
                            at: Local::now(),
                            filename: target.filename(),
                        });
                    } else {
                        warn!(
                            "{program} exited cleanly but {} was not written",
                            target.path.display()
                        );
                    }
                }
                Some(Ok(status)) => warn!("{program} exited with {status}"),
                Some(Err(e)) => warn!("Cannot wait for {program}: {e}"),
            }
            let _ = signals.send(DeviceSignal::Ended {
                token,
                at: Local::now(),
            });
        });

        Ok(CaptureHandle::new(cancel, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// A capture program that takes `delay` before writing its output
    /// (the path after `-o`, i.e. `$7`).
    fn slow_camera(dir: &Path, delay: &str) -> String {
        let path = dir.join("slow-camera.sh");
        std::fs::write(&path, format!("#!/bin/sh\nsleep {delay}\necho img > \"$7\"\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<DeviceSignal>) -> Vec<DeviceSignal> {
        let mut out = Vec::new();
        while let Some(sig) = rx.recv().await {
            out.push(sig);
        }
        out
    }

    #[test]
    fn test_args() {
        let device = StillCommandDevice::new("raspistill", 500, vec!["-w".into(), "640".into()]);
        assert_eq!(
            device.args(Path::new("./images/a.jpg")),
            vec!["-n", "-e", "jpg", "-t", "500", "-o", "./images/a.jpg", "-w", "640"]
        );
    }

    #[tokio::test]
    async fn test_start_requires_configure() {
        let device = StillCommandDevice::new("true", 0, vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(device.start(tx), Err(DeviceError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let device = StillCommandDevice::new("/nonexistent/still-capture", 0, vec![]);
        device.configure(CaptureTarget {
            token: 1,
            path: PathBuf::from("/tmp/never.jpg"),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(device.start(tx), Err(DeviceError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_signals_in_order_when_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        // `true` ignores its arguments and exits 0; the file already exists.
        let device = StillCommandDevice::new("true", 0, vec![]);
        device.configure(CaptureTarget { token: 7, path });
        let (tx, rx) = mpsc::unbounded_channel();
        device.start(tx).unwrap();

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 3);
        assert!(matches!(signals[0], DeviceSignal::Started { token: 7, .. }));
        assert!(matches!(
            &signals[1],
            DeviceSignal::Completed { token: 7, filename, .. } if filename == "shot.jpg"
        ));
        assert!(matches!(signals[2], DeviceSignal::Ended { token: 7, .. }));
    }

    #[tokio::test]
    async fn test_no_completed_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = StillCommandDevice::new("true", 0, vec![]);
        device.configure(CaptureTarget {
            token: 3,
            path: dir.path().join("missing.jpg"),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        device.start(tx).unwrap();

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 2);
        assert!(matches!(signals[0], DeviceSignal::Started { .. }));
        assert!(matches!(signals[1], DeviceSignal::Ended { .. }));
    }

    #[tokio::test]
    async fn test_abort_kills_slow_capture() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        let output = images.join("late.jpg");

        let device = StillCommandDevice::new(slow_camera(dir.path(), "0.5"), 0, vec![]);
        device.configure(CaptureTarget {
            token: 9,
            path: output.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = device.start(tx).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort().await;

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 2);
        assert!(matches!(signals[0], DeviceSignal::Started { token: 9, .. }));
        assert!(matches!(signals[1], DeviceSignal::Ended { token: 9, .. }));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!output.exists(), "cancelled capture still wrote its image");
    }

    #[tokio::test]
    async fn test_abort_after_completion_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let device = StillCommandDevice::new("true", 0, vec![]);
        device.configure(CaptureTarget {
            token: 4,
            path: path.clone(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = device.start(tx).unwrap();

        while let Some(signal) = rx.recv().await {
            if matches!(signal, DeviceSignal::Completed { .. }) {
                break;
            }
        }
        handle.abort().await;
        assert!(path.exists());
    }
}
