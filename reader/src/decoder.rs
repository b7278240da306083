//! Barcode decoding via `zbarimg`.
//!
//! Decoding is a blocking call; the coordinator moves it onto the blocking
//! pool and never runs two at once. A `zbarimg` that outlives its deadline
//! is killed.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

/// `zbarimg` exit status when it processed the image but found nothing.
const ZBAR_NOT_FOUND: i32 = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Found { code: String },
    NotFound,
    Error { reason: String },
}

pub trait BarcodeDecoder: Send + Sync {
    fn decode(&self, image: &Path) -> DecodeOutcome;
}

/// Shells out to `zbarimg` with every symbology disabled except the
/// configured ones.
#[derive(Debug, Clone)]
pub struct ZbarDecoder {
    program: String,
    symbologies: Vec<String>,
    timeout: Duration,
}

impl ZbarDecoder {
    pub fn new(program: impl Into<String>, symbologies: Vec<String>, timeout: Duration) -> Self {
        ZbarDecoder {
            program: program.into(),
            symbologies,
            timeout,
        }
    }

    pub fn args(&self, image: &Path) -> Vec<String> {
        let mut args = vec![
            "--quiet".to_string(),
            "--raw".to_string(),
            "-Sdisable".to_string(),
        ];
        for sym in &self.symbologies {
            args.push(format!("-S{sym}.enable"));
        }
        args.push(image.to_string_lossy().into_owned());
        args
    }
}

impl BarcodeDecoder for ZbarDecoder {
    fn decode(&self, image: &Path) -> DecodeOutcome {
        let args = self.args(image);
        debug!("Running: {} {}", self.program, args.join(" "));

        let spawned = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return DecodeOutcome::Error {
                    reason: format!("cannot run {}: {e}", self.program),
                }
            }
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return DecodeOutcome::Error {
                        reason: format!(
                            "{} timed out after {}ms",
                            self.program,
                            self.timeout.as_millis()
                        ),
                    };
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return DecodeOutcome::Error {
                        reason: format!("waiting for {} failed: {e}", self.program),
                    }
                }
            }
        }

        match child.wait_with_output() {
            Ok(output) => interpret(&self.program, &output),
            Err(e) => DecodeOutcome::Error {
                reason: format!("reading {} output failed: {e}", self.program),
            },
        }
    }
}

/// Map a finished `zbarimg` run to an outcome. Only the first symbol is kept.
fn interpret(program: &str, output: &Output) -> DecodeOutcome {
    let first_line = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from);

    match output.status.code() {
        Some(0) => match first_line {
            Some(code) => DecodeOutcome::Found { code },
            None => DecodeOutcome::NotFound,
        },
        Some(ZBAR_NOT_FOUND) => DecodeOutcome::NotFound,
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            let reason = if detail.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                format!("{program} exited with {}: {detail}", output.status)
            };
            DecodeOutcome::Error { reason }
        }
    }
}
