//! Configuration parsing – reads a KEY=VALUE file and lets environment
//! variables of the same name override it.
//!
//! The zone tag lives in its own small state file next to the service and
//! is read once at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Zone tag used when the zone state file is missing, unreadable or empty.
pub const ZONE_PLACEHOLDER: &str = "NOZONE";

/// How the image filename is built for each capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameScheme {
    /// `<random>.jpg`
    Random,
    /// `<zone>_<seq>_<random>.jpg`
    Zoned,
}

/// Shape of a successful `take` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeResponse {
    /// 200 with the JSON result envelope.
    Json,
    /// 204 with an empty body. Failures still carry the JSON envelope.
    Empty,
}

/// What happens to a `take` that arrives while another capture is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queue,
    Reject,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── http ─────────────────────────────────────────────────────────
    pub port: u16,
    /// Mount prefix for every route, e.g. `/reader`. Empty mounts at root.
    pub prefix: String,
    pub take_response: TakeResponse,

    // ── storage ──────────────────────────────────────────────────────
    pub image_dir: PathBuf,
    pub zone_file: PathBuf,
    pub filename_scheme: FilenameScheme,

    // ── camera ───────────────────────────────────────────────────────
    pub capture_program: String,
    /// Delay handed to the capture program before it fires.
    pub capture_timeout_ms: u64,
    pub capture_extra_args: Vec<String>,
    /// Upper bound on how long a request waits for the Completed signal.
    pub completion_timeout_ms: u64,
    pub admission: Admission,

    // ── barcode ──────────────────────────────────────────────────────
    pub decode: bool,
    pub decoder_program: String,
    pub symbologies: Vec<String>,
    /// A decode still running after this long is abandoned.
    pub decode_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8886,
            prefix: "/reader".into(),
            take_response: TakeResponse::Json,
            image_dir: PathBuf::from("./images"),
            zone_file: PathBuf::from("./zone"),
            filename_scheme: FilenameScheme::Random,
            capture_program: "raspistill".into(),
            capture_timeout_ms: 500,
            capture_extra_args: Vec::new(),
            completion_timeout_ms: 10_000,
            admission: Admission::Queue,
            decode: true,
            decoder_program: "zbarimg".into(),
            symbologies: vec!["code128".into()],
            decode_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/barcam/barcam.conf"
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }
}

/// Load configuration for the service.
///
/// With an explicit `path` the file must be readable. Without one the
/// default path is tried and silently skipped when absent. Environment
/// variables win over file values in both cases.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut map = read_conf(path)?;
    for key in KEYS {
        if let Ok(val) = std::env::var(key) {
            map.insert(key.to_string(), val);
        }
    }

    Ok(from_map(&map))
}

/// Raw file values, before environment overrides.
fn read_conf(path: Option<&Path>) -> Result<HashMap<String, String>> {
    let map = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("Cannot read config: {}", p.display()))?;
            info!("Loaded config from {}", p.display());
            parse_conf(&text)
        }
        None => {
            let p = Path::new(Config::default_path());
            match std::fs::read_to_string(p) {
                Ok(text) => {
                    info!("Loaded config from {}", p.display());
                    parse_conf(&text)
                }
                Err(_) => {
                    info!("No config at {}, using defaults", p.display());
                    HashMap::new()
                }
            }
        }
    };
    Ok(map)
}

const KEYS: &[&str] = &[
    "READERPORT",
    "READER_PREFIX",
    "IMAGE_DIR",
    "ZONE_FILE",
    "CAPTURE_PROGRAM",
    "CAPTURE_TIMEOUT_MS",
    "CAPTURE_EXTRA_ARGS",
    "COMPLETION_TIMEOUT_MS",
    "DECODE",
    "DECODER_PROGRAM",
    "BARCODE_SYMBOLOGIES",
    "DECODE_TIMEOUT_MS",
    "FILENAME_SCHEME",
    "TAKE_RESPONSE",
    "ADMISSION",
];

fn from_map(map: &HashMap<String, String>) -> Config {
    let defaults = Config::default();
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        match get(key) {
            None => default,
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("Invalid {key}={v:?}, using {default}");
                default
            }),
        }
    };

    let port = match get("READERPORT") {
        None => defaults.port,
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!("Invalid READERPORT={v:?}, using {}", defaults.port);
            defaults.port
        }),
    };

    let decode = match get("DECODE") {
        None => defaults.decode,
        Some(v) => parse_bool(&v).unwrap_or_else(|| {
            warn!("Invalid DECODE={v:?}, using {}", defaults.decode);
            defaults.decode
        }),
    };

    let filename_scheme = match get("FILENAME_SCHEME").as_deref().map(str::trim) {
        None => defaults.filename_scheme,
        Some(v) if v.eq_ignore_ascii_case("random") => FilenameScheme::Random,
        Some(v) if v.eq_ignore_ascii_case("zoned") => FilenameScheme::Zoned,
        Some(v) => {
            warn!("Unknown FILENAME_SCHEME={v:?}, using random");
            defaults.filename_scheme
        }
    };

    let take_response = match get("TAKE_RESPONSE").as_deref().map(str::trim) {
        None => defaults.take_response,
        Some(v) if v.eq_ignore_ascii_case("json") => TakeResponse::Json,
        Some(v) if v.eq_ignore_ascii_case("empty") => TakeResponse::Empty,
        Some(v) => {
            warn!("Unknown TAKE_RESPONSE={v:?}, using json");
            defaults.take_response
        }
    };

    let admission = match get("ADMISSION").as_deref().map(str::trim) {
        None => defaults.admission,
        Some(v) if v.eq_ignore_ascii_case("queue") => Admission::Queue,
        Some(v) if v.eq_ignore_ascii_case("reject") => Admission::Reject,
        Some(v) => {
            warn!("Unknown ADMISSION={v:?}, using queue");
            defaults.admission
        }
    };

    let symbologies: Vec<String> = get("BARCODE_SYMBOLOGIES")
        .map(|s| {
            s.split(',')
                .map(|sym| sym.trim().to_ascii_lowercase())
                .filter(|sym| !sym.is_empty())
                .collect()
        })
        .filter(|list: &Vec<String>| !list.is_empty())
        .unwrap_or(defaults.symbologies);

    Config {
        port,
        prefix: normalize_prefix(&get("READER_PREFIX").unwrap_or(defaults.prefix)),
        take_response,
        image_dir: get("IMAGE_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.image_dir),
        zone_file: get("ZONE_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.zone_file),
        filename_scheme,
        capture_program: get("CAPTURE_PROGRAM")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.capture_program),
        capture_timeout_ms: get_u64("CAPTURE_TIMEOUT_MS", defaults.capture_timeout_ms),
        capture_extra_args: get("CAPTURE_EXTRA_ARGS")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        completion_timeout_ms: get_u64("COMPLETION_TIMEOUT_MS", defaults.completion_timeout_ms),
        admission,
        decode,
        decoder_program: get("DECODER_PROGRAM")
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.decoder_program),
        symbologies,
        decode_timeout_ms: get_u64("DECODE_TIMEOUT_MS", defaults.decode_timeout_ms),
    }
}

/// Read the zone tag from its state file.
///
/// Returns the tag and whether the placeholder had to be used. Read errors
/// are deliberately not surfaced.
pub fn read_zone(path: &Path) -> (String, bool) {
    let zone = std::fs::read_to_string(path).ok().and_then(|text| {
        text.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(String::from)
    });
    match zone {
        Some(z) => (z, false),
        None => (ZONE_PLACEHOLDER.to_string(), true),
    }
}

/// `""` and `"/"` mount at root; anything else gets a single leading slash
/// and no trailing one.
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
