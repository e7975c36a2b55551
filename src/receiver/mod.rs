//! Alert receiver for the display node.
//!
//! Minimal HTTP/1.1 server: `GET /` answers a liveness line, `POST /alert`
//! accepts the edge node's JSON alert and switches the display into alert
//! mode for a fixed duration, `GET /status` reports the display state.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alert::ALERT_EVENT;

const MAX_REQUEST_BYTES: usize = 8192;
const ONLINE_BANNER: &str = "TeaTime IoT Node Online";

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    pub addr: String,
    /// How long an alert stays on screen.
    pub display_duration: Duration,
    /// Shown on the idle screen.
    pub windows: Vec<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:80".to_string(),
            display_duration: Duration::from_secs(60),
            windows: vec!["10:00 - 12:00".to_string(), "14:30 - 16:00".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DisplayState {
    Idle { windows: Vec<String> },
    Alert { time: String },
}

/// What the screen shows. Alerts expire back to idle.
#[derive(Debug)]
pub struct AlertDisplay {
    windows: Vec<String>,
    duration: Duration,
    active: Option<(String, Instant)>,
    received: u64,
}

impl AlertDisplay {
    pub fn new(windows: Vec<String>, duration: Duration) -> Self {
        Self {
            windows,
            duration,
            active: None,
            received: 0,
        }
    }

    pub fn show_alert(&mut self, timestamp: &str, now: Instant) {
        let time = clock_part(timestamp);
        log::info!("TEA / COFFEE ARRIVED! {}", time);
        self.active = Some((time, now));
        self.received += 1;
    }

    pub fn state(&mut self, now: Instant) -> DisplayState {
        if let Some((_, since)) = &self.active {
            if now.saturating_duration_since(*since) >= self.duration {
                log::info!("alert display expired, back to idle");
                self.active = None;
            }
        }
        match &self.active {
            Some((time, _)) => DisplayState::Alert { time: time.clone() },
            None => DisplayState::Idle {
                windows: self.windows.clone(),
            },
        }
    }

    pub fn alerts_received(&self) -> u64 {
        self.received
    }
}

/// `HH:MM` following the first `T` of an ISO timestamp; the raw text otherwise.
pub fn clock_part(timestamp: &str) -> String {
    match timestamp.find('T') {
        Some(idx) if idx > 0 => timestamp[idx + 1..].chars().take(5).collect(),
        _ => timestamp.to_string(),
    }
}

#[derive(Debug)]
pub struct ReceiverHandle {
    pub addr: SocketAddr,
    display: Arc<Mutex<AlertDisplay>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    pub fn display_state(&self) -> Result<DisplayState> {
        let mut display = self
            .display
            .lock()
            .map_err(|_| anyhow!("display lock poisoned"))?;
        Ok(display.state(Instant::now()))
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("alert receiver thread panicked"))?;
        }
        Ok(())
    }
}

pub struct AlertReceiver {
    cfg: ReceiverConfig,
}

impl AlertReceiver {
    pub fn new(cfg: ReceiverConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<ReceiverHandle> {
        let configured: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let display = Arc::new(Mutex::new(AlertDisplay::new(
            self.cfg.windows.clone(),
            self.cfg.display_duration,
        )));
        let shutdown = Arc::new(AtomicBool::new(false));
        let display_thread = display.clone();
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = serve(listener, display_thread, shutdown_thread) {
                log::error!("alert receiver stopped: {}", err);
            }
        });

        Ok(ReceiverHandle {
            addr,
            display,
            shutdown,
            join: Some(join),
        })
    }
}

fn serve(
    listener: TcpListener,
    display: Arc<Mutex<AlertDisplay>>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = handle_connection(stream, &display) {
                    log::warn!("request from {} failed: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, display: &Mutex<AlertDisplay>) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let (status, content_type, body) = route(&request, display)?;
    write_response(&mut stream, status, content_type, body.as_bytes())
}

fn route(request: &HttpRequest, display: &Mutex<AlertDisplay>) -> Result<(u16, &'static str, String)> {
    let mut display = display
        .lock()
        .map_err(|_| anyhow!("display lock poisoned"))?;
    let now = Instant::now();
    let response = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => (200, "text/plain", ONLINE_BANNER.to_string()),
        ("GET", "/status") => {
            let status = serde_json::json!({
                "display": display.state(now),
                "alerts_received": display.alerts_received(),
            });
            (200, "application/json", status.to_string())
        }
        (_, "/status") => (405, "text/plain", "Method Not Allowed".to_string()),
        ("POST", "/alert") => match serde_json::from_slice::<serde_json::Value>(&request.body) {
            Err(err) => {
                log::warn!("alert body rejected: {}", err);
                (400, "text/plain", "Invalid JSON".to_string())
            }
            Ok(doc) if doc.get("event").and_then(|e| e.as_str()) == Some(ALERT_EVENT) => {
                let timestamp = doc.get("timestamp").and_then(|t| t.as_str()).unwrap_or("");
                display.show_alert(timestamp, now);
                (200, "text/plain", "Alert Received".to_string())
            }
            Ok(_) => (400, "text/plain", "Unknown Event".to_string()),
        },
        (_, "/alert") => (405, "text/plain", "Method Not Allowed".to_string()),
        _ => (404, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid Content-Length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_line,
        content_type,
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_part_extracts_hours_and_minutes() {
        assert_eq!(clock_part("2024-05-06T10:15:30.123456"), "10:15");
        assert_eq!(clock_part("2024-05-06T9:1"), "9:1");
        assert_eq!(clock_part("no time"), "no time");
        assert_eq!(clock_part("T10:15"), "T10:15");
    }

    #[test]
    fn alert_expires_after_display_duration() {
        let start = Instant::now();
        let mut display = AlertDisplay::new(vec!["10:00 - 12:00".into()], Duration::from_secs(60));
        display.show_alert("2024-05-06T10:15:30", start);
        assert_eq!(
            display.state(start + Duration::from_secs(59)),
            DisplayState::Alert { time: "10:15".into() }
        );
        assert!(matches!(
            display.state(start + Duration::from_secs(60)),
            DisplayState::Idle { .. }
        ));
        assert_eq!(display.alerts_received(), 1);
    }

    fn request(method: &str, path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn alert_route_contract() {
        let display = Mutex::new(AlertDisplay::new(Vec::new(), Duration::from_secs(60)));
        let status = |req: HttpRequest| route(&req, &display).unwrap();

        assert_eq!(status(request("GET", "/", "")).2, ONLINE_BANNER);
        assert_eq!(status(request("GET", "/alert", "")).0, 405);
        assert_eq!(status(request("POST", "/alert", "{oops")), (400, "text/plain", "Invalid JSON".into()));
        assert_eq!(
            status(request("POST", "/alert", r#"{"event":"door_open"}"#)),
            (400, "text/plain", "Unknown Event".into())
        );
        assert_eq!(
            status(request(
                "POST",
                "/alert",
                r#"{"event":"tea_service_detected","confidence":0.9,"timestamp":"2024-05-06T14:45:00"}"#
            )),
            (200, "text/plain", "Alert Received".into())
        );
        assert_eq!(status(request("GET", "/missing", "")).0, 404);
        assert!(status(request("GET", "/status", "")).2.contains("\"time\":\"14:45\""));
    }
}
