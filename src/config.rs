use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::classify::{HsvRange, DEFAULT_LOWER, DEFAULT_MATCH_THRESHOLD, DEFAULT_UPPER};
use crate::gate::TimeWindow;

const DEFAULT_TIME_WINDOWS: [&str; 2] = ["10:00-12:00", "14:30-16:00"];
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;
const DEFAULT_COOLDOWN_SECS: u64 = 900;
const DEFAULT_ALERT_HOST: &str = "192.168.1.100";
const DEFAULT_ALERT_PORT: u16 = 80;
const DEFAULT_ALERT_PATH: &str = "/alert";
const DEFAULT_ALERT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MODEL_PATH: &str =
    "/usr/local/lib/node_modules/mono2d_body_detection/config/fcos_512x512_nv12.bin";
const DEFAULT_MODEL_INPUT: u32 = 512;
const DEFAULT_DNN_LIBRARY: &str = "/usr/lib/libdnn.so";
const DEFAULT_POSTPROCESS_LIBRARY: &str = "/usr/lib/libpostprocess.so";
const DEFAULT_SSD_MODEL: &str = "models/MobileNetSSD_deploy.onnx";
const DEFAULT_SSD_INPUT: u32 = 300;
const DEFAULT_SOURCE_URL: &str = "rtsp://127.0.0.1:554/stream";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_FIGURE_EVERY: u64 = 10;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "teatimed";
const DEFAULT_FRAME_TOPIC: &str = "teatime/camera/frame";
const DEFAULT_DETECTION_TOPIC: &str = "teatime/camera/detections";
const DEFAULT_STALENESS_MS: u64 = 500;
const DEFAULT_DORMANT_SLEEP_SECS: u64 = 60;
const DEFAULT_COOLING_POLL_MS: u64 = 1000;
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 100;

#[derive(Debug, Deserialize, Default)]
struct TeatimeConfigFile {
    time_windows: Option<Vec<String>>,
    uniform: Option<UniformConfigFile>,
    detection: Option<DetectionConfigFile>,
    cooldown_secs: Option<u64>,
    alert: Option<AlertConfigFile>,
    hardware: Option<HardwareConfigFile>,
    software: Option<SoftwareConfigFile>,
    source: Option<SourceConfigFile>,
    push: Option<PushConfigFile>,
    mode: Option<String>,
    polling: Option<PollingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct UniformConfigFile {
    lower: Option<[u8; 3]>,
    upper: Option<[u8; 3]>,
    match_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    use_hardware: Option<bool>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct HardwareConfigFile {
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    dnn_library: Option<PathBuf>,
    postprocess_library: Option<PathBuf>,
    decoder: Option<String>,
    num_classes: Option<usize>,
    score_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    nms_top_k: Option<u32>,
    pad_resize: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SoftwareConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    figure_every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PushConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    frame_topic: Option<String>,
    detection_topic: Option<String>,
    staleness_ms: Option<u64>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PollingConfigFile {
    dormant_sleep_secs: Option<u64>,
    cooling_poll_ms: Option<u64>,
    cycle_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TeatimeConfig {
    pub time_windows: Vec<TimeWindow>,
    pub uniform: UniformSettings,
    pub detection: DetectionSettings,
    pub cooldown: Duration,
    pub alert: AlertSettings,
    pub hardware: HardwareSettings,
    pub software: SoftwareModelSettings,
    pub source: SourceSettings,
    pub push: PushSettings,
    pub mode: RunMode,
    pub polling: PollingSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformSettings {
    pub range: HsvRange,
    pub match_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    /// Try the accelerator before falling back to the CPU detector.
    pub use_hardware: bool,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
}

impl AlertSettings {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    /// Vendor `libpostprocess.so`.
    Native,
    /// In-crate FCOS decode.
    Builtin,
}

impl FromStr for DecoderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "builtin" => Ok(Self::Builtin),
            other => Err(anyhow!(
                "unknown decoder '{}': expected 'native' or 'builtin'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HardwareSettings {
    pub model_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub dnn_library: PathBuf,
    pub postprocess_library: PathBuf,
    pub decoder: DecoderKind,
    pub num_classes: usize,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub nms_top_k: u32,
    pub pad_resize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareModelSettings {
    pub model_path: PathBuf,
    pub input_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub figure_every: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSettings {
    pub broker: String,
    pub client_id: String,
    pub frame_topic: String,
    pub detection_topic: String,
    pub staleness_tolerance: Duration,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Pull frames from the source and run detection locally.
    Polling,
    /// Consume frames and detections pushed over MQTT.
    Push,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "polling" | "poll" => Ok(Self::Polling),
            "push" => Ok(Self::Push),
            other => Err(anyhow!(
                "unknown mode '{}': expected 'polling' or 'push'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingSettings {
    pub dormant_sleep: Duration,
    pub cooling_poll: Duration,
    pub cycle_interval: Duration,
}

impl TeatimeConfig {
    /// Defaults, then the file named by `TEATIME_CONFIG`, then `TEATIME_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TEATIME_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit config file instead of `TEATIME_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TeatimeConfigFile) -> Result<Self> {
        let time_windows = match file.time_windows {
            Some(windows) => parse_windows(windows.iter().map(String::as_str))?,
            None => parse_windows(DEFAULT_TIME_WINDOWS.iter().copied())?,
        };

        let uniform_file = file.uniform.unwrap_or_default();
        let uniform = UniformSettings {
            range: HsvRange {
                lower: uniform_file.lower.unwrap_or(DEFAULT_LOWER),
                upper: uniform_file.upper.unwrap_or(DEFAULT_UPPER),
            },
            match_threshold: uniform_file
                .match_threshold
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            use_hardware: detection_file.use_hardware.unwrap_or(true),
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
        };

        let alert_file = file.alert.unwrap_or_default();
        let alert = AlertSettings {
            host: alert_file
                .host
                .unwrap_or_else(|| DEFAULT_ALERT_HOST.to_string()),
            port: alert_file.port.unwrap_or(DEFAULT_ALERT_PORT),
            path: alert_file
                .path
                .unwrap_or_else(|| DEFAULT_ALERT_PATH.to_string()),
            timeout: Duration::from_secs(
                alert_file
                    .timeout_secs
                    .unwrap_or(DEFAULT_ALERT_TIMEOUT_SECS),
            ),
        };

        let hw = file.hardware.unwrap_or_default();
        let hardware = HardwareSettings {
            model_path: hw
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_width: hw.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: hw.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            dnn_library: hw
                .dnn_library
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DNN_LIBRARY)),
            postprocess_library: hw
                .postprocess_library
                .unwrap_or_else(|| PathBuf::from(DEFAULT_POSTPROCESS_LIBRARY)),
            decoder: match hw.decoder.as_deref() {
                Some(kind) => kind.parse()?,
                None => DecoderKind::Native,
            },
            num_classes: hw.num_classes.unwrap_or(crate::bpu::postprocess::DEFAULT_NUM_CLASSES),
            score_threshold: hw.score_threshold.unwrap_or(0.5),
            nms_threshold: hw.nms_threshold.unwrap_or(0.6),
            nms_top_k: hw.nms_top_k.unwrap_or(5),
            pad_resize: hw.pad_resize.unwrap_or(false),
        };

        let sw = file.software.unwrap_or_default();
        let software = SoftwareModelSettings {
            model_path: sw
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SSD_MODEL)),
            input_size: sw.input_size.unwrap_or(DEFAULT_SSD_INPUT),
        };

        let src = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: src.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: src.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: src.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: src.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            figure_every: src.figure_every.unwrap_or(DEFAULT_FIGURE_EVERY),
        };

        let p = file.push.unwrap_or_default();
        let push = PushSettings {
            broker: p.broker.unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            client_id: p
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            frame_topic: p
                .frame_topic
                .unwrap_or_else(|| DEFAULT_FRAME_TOPIC.to_string()),
            detection_topic: p
                .detection_topic
                .unwrap_or_else(|| DEFAULT_DETECTION_TOPIC.to_string()),
            staleness_tolerance: Duration::from_millis(
                p.staleness_ms.unwrap_or(DEFAULT_STALENESS_MS),
            ),
            use_tls: p.use_tls.unwrap_or(false),
            tls_ca_path: p.tls_ca_path,
            tls_client_cert_path: p.tls_client_cert_path,
            tls_client_key_path: p.tls_client_key_path,
        };

        let mode = match file.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => RunMode::Polling,
        };

        let pl = file.polling.unwrap_or_default();
        let polling = PollingSettings {
            dormant_sleep: Duration::from_secs(
                pl.dormant_sleep_secs.unwrap_or(DEFAULT_DORMANT_SLEEP_SECS),
            ),
            cooling_poll: Duration::from_millis(
                pl.cooling_poll_ms.unwrap_or(DEFAULT_COOLING_POLL_MS),
            ),
            cycle_interval: Duration::from_millis(
                pl.cycle_interval_ms.unwrap_or(DEFAULT_CYCLE_INTERVAL_MS),
            ),
        };

        Ok(Self {
            time_windows,
            uniform,
            detection,
            cooldown: Duration::from_secs(file.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS)),
            alert,
            hardware,
            software,
            source,
            push,
            mode,
            polling,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("TEATIME_ALERT_HOST") {
            if !host.trim().is_empty() {
                self.alert.host = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("TEATIME_ALERT_PORT") {
            self.alert.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("TEATIME_ALERT_PORT must be a port number"))?;
        }
        if let Ok(url) = std::env::var("TEATIME_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(flag) = std::env::var("TEATIME_USE_HARDWARE") {
            self.detection.use_hardware = parse_bool(&flag)
                .ok_or_else(|| anyhow!("TEATIME_USE_HARDWARE must be true or false"))?;
        }
        if let Ok(cooldown) = std::env::var("TEATIME_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("TEATIME_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(windows) = std::env::var("TEATIME_TIME_WINDOWS") {
            let parsed = split_csv(&windows);
            if !parsed.is_empty() {
                self.time_windows = parse_windows(parsed.iter().map(String::as_str))?;
            }
        }
        if let Ok(mode) = std::env::var("TEATIME_MODE") {
            if !mode.trim().is_empty() {
                self.mode = mode.parse()?;
            }
        }
        if let Ok(broker) = std::env::var("TEATIME_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.push.broker = broker;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.time_windows.is_empty() {
            return Err(anyhow!("at least one time window must be configured"));
        }
        self.uniform.range.validate()?;
        if !(0.0..=100.0).contains(&self.uniform.match_threshold) {
            return Err(anyhow!(
                "uniform match threshold must be within 0-100, got {}",
                self.uniform.match_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!(
                "detection confidence threshold must be within 0-1, got {}",
                self.detection.confidence_threshold
            ));
        }
        if self.cooldown.as_secs() == 0 {
            return Err(anyhow!("cooldown must be greater than zero"));
        }
        if self.hardware.input_width == 0 || self.hardware.input_height == 0 {
            return Err(anyhow!("hardware model input dimensions must be non-zero"));
        }
        if self.hardware.num_classes == 0 {
            return Err(anyhow!("hardware model must declare at least one class"));
        }
        for (name, value) in [
            ("score", self.hardware.score_threshold),
            ("nms", self.hardware.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("hardware {} threshold must be within 0-1, got {}", name, value));
            }
        }
        if self.software.input_size == 0 {
            return Err(anyhow!("software model input size must be non-zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be non-zero"));
        }
        if !self.alert.path.starts_with('/') {
            return Err(anyhow!("alert path must start with '/', got {}", self.alert.path));
        }
        Ok(())
    }
}

fn parse_windows<'a>(values: impl Iterator<Item = &'a str>) -> Result<Vec<TimeWindow>> {
    values.map(TimeWindow::parse).collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<TeatimeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
