//! Push mode over MQTT.
//!
//! A camera-side publisher sends JPEG frames on one topic and detection
//! batches on another. Frames land in a `LatestFrame` cell; each batch is
//! handed to the pipeline together with whatever frame is current.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PushSettings;
use crate::detect::{Detection, PERSON_LABEL};
use crate::frame::{BoundingBox, Frame, LatestFrame, PixelLayout};
use crate::gate::Clock;
use crate::pipeline::{CycleOutcome, DetectionBatch, Pipeline};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Broker address after scheme handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Accepts `host:port`, `[v6]:port`, and `mqtt://`, `tcp://`, `mqtts://`,
/// `ssl://` prefixes. The secure schemes force TLS on.
pub fn parse_mqtt_endpoint(addr: &str, use_tls: bool) -> Result<MqttEndpoint> {
    let mut use_tls = use_tls;
    let mut rest = addr.trim();
    if let Some((scheme, tail)) = rest.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        rest = tail;
    }

    let (host, port) = match rest.strip_prefix('[') {
        Some(v6) => {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
            (host, port)
        }
        None => rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?,
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// PEM material for broker TLS. Absent CA means the bundled web roots.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let read = |what: &str, path: &PathBuf| {
            std::fs::read(path)
                .with_context(|| format!("failed to read MQTT {} '{}'", what, path.display()))
        };
        let ca = ca_path.map(|p| read("CA certificate", p)).transpose()?;
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((read("client certificate", cert)?, read("client key", key)?)),
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("MQTT client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("MQTT client key provided without certificate")),
        };
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS material configured but the broker endpoint is plain TCP; \
                     use an mqtts:// address or set push.use_tls"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self
            .ca
            .clone()
            .ok_or_else(|| anyhow!("MQTT client certificates require a CA certificate"))?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageTimestamp {
    EpochMillis(i64),
    Rfc3339(String),
}

#[derive(Debug, Deserialize)]
struct PushedDetection {
    #[serde(rename = "box")]
    bbox: [f32; 4],
    score: f32,
    #[serde(default = "person_label")]
    label: String,
}

#[derive(Debug, Deserialize)]
struct DetectionMessage {
    timestamp: MessageTimestamp,
    #[serde(default)]
    detections: Vec<PushedDetection>,
}

fn person_label() -> String {
    PERSON_LABEL.to_string()
}

/// Parse a detection batch:
/// `{"timestamp": <RFC 3339 | epoch ms>, "detections": [{"box": [x1,y1,x2,y2], "score": f, "label": "person"}]}`.
pub fn parse_detection_batch(payload: &[u8]) -> Result<DetectionBatch> {
    let message: DetectionMessage =
        serde_json::from_slice(payload).context("invalid detection message")?;
    let captured_at = match message.timestamp {
        MessageTimestamp::EpochMillis(ms) => Local
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| anyhow!("timestamp {} out of range", ms))?,
        MessageTimestamp::Rfc3339(text) => DateTime::parse_from_rfc3339(&text)
            .with_context(|| format!("invalid timestamp '{}'", text))?
            .with_timezone(&Local),
    };
    let detections = message
        .detections
        .into_iter()
        .map(|d| Detection::new(BoundingBox::from_f32(d.bbox), d.score.clamp(0.0, 1.0), d.label))
        .collect();
    Ok(DetectionBatch {
        captured_at,
        detections,
    })
}

/// Decode a JPEG frame, stamped with the arrival time.
pub fn decode_frame(payload: &[u8], received_at: DateTime<Local>) -> Result<Frame> {
    let image = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
        .context("invalid JPEG frame")?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::new(image.into_raw(), width, height, PixelLayout::Rgb24, received_at)
}

/// Route one publish. Frames update the cell; batches run through the
/// pipeline and report its outcome.
pub fn route_message<C: Clock>(
    topic: &str,
    payload: &[u8],
    settings: &PushSettings,
    latest: &LatestFrame,
    pipeline: &mut Pipeline<C>,
) -> Result<Option<CycleOutcome>> {
    if topic == settings.frame_topic {
        let frame = decode_frame(payload, pipeline.gate().clock().now())?;
        latest.store(frame)?;
        Ok(None)
    } else if topic == settings.detection_topic {
        let batch = parse_detection_batch(payload)?;
        let outcome = pipeline.handle_detection_batch(&batch, latest)?;
        log::debug!("detection batch: {:?}", outcome);
        Ok(Some(outcome))
    } else {
        log::debug!("ignoring publish on {}", topic);
        Ok(None)
    }
}

fn connect(
    endpoint: &MqttEndpoint,
    tls: &TlsMaterials,
    client_id: &str,
) -> Result<(Client, Connection)> {
    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    options.set_transport(tls.build_transport(endpoint)?);
    let (client, connection) = Client::new(options, 10);
    log::info!(
        "connecting to MQTT broker {}:{} (TLS: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls
    );
    Ok((client, connection))
}

/// Subscribe to the frame and detection topics and feed the pipeline until
/// `shutdown` is set. Connection errors trigger a reconnect after 5 s.
pub fn run_push<C: Clock>(
    settings: &PushSettings,
    mut pipeline: Pipeline<C>,
    latest: Arc<LatestFrame>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let endpoint = parse_mqtt_endpoint(&settings.broker, settings.use_tls)?;
    let tls = TlsMaterials::load(
        settings.tls_ca_path.as_ref(),
        settings.tls_client_cert_path.as_ref(),
        settings.tls_client_key_path.as_ref(),
    )?;

    while !shutdown.load(Ordering::SeqCst) {
        let (client, mut connection) = connect(&endpoint, &tls, &settings.client_id)?;
        client.subscribe(&settings.frame_topic, QoS::AtMostOnce)?;
        client.subscribe(&settings.detection_topic, QoS::AtMostOnce)?;
        log::info!(
            "subscribed to {} and {}",
            settings.frame_topic,
            settings.detection_topic
        );

        for event in connection.iter() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(e) => {
                            log::warn!("skipping publish with invalid topic: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) =
                        route_message(topic, &publish.payload, settings, &latest, &mut pipeline)
                    {
                        log::warn!("failed to process message on {}: {:#}", topic, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    break;
                }
            }
        }

        if !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(RECONNECT_DELAY);
        }
    }
    log::info!("push subscriber stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_forms() {
        let plain = parse_mqtt_endpoint("127.0.0.1:1883", false).unwrap();
        assert_eq!((plain.host.as_str(), plain.port, plain.use_tls), ("127.0.0.1", 1883, false));

        let secure = parse_mqtt_endpoint("mqtts://broker.local:8883", false).unwrap();
        assert!(secure.use_tls);
        assert_eq!(secure.host, "broker.local");

        let v6 = parse_mqtt_endpoint("[::1]:1883", false).unwrap();
        assert_eq!(v6.host, "::1");

        assert!(parse_mqtt_endpoint("http://x:1", false).is_err());
        assert!(parse_mqtt_endpoint("broker", false).is_err());
        assert!(parse_mqtt_endpoint(":1883", false).is_err());
    }

    #[test]
    fn tls_material_on_plain_endpoint_is_rejected() {
        let tls = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        let endpoint = parse_mqtt_endpoint("broker:1883", false).unwrap();
        assert!(tls.build_transport(&endpoint).is_err());
    }

    #[test]
    fn client_cert_requires_key() {
        let err = TlsMaterials::load(None, Some(&PathBuf::from("/nonexistent/cert.pem")), None)
            .unwrap_err();
        assert!(err.to_string().contains("without key"));
    }

    #[test]
    fn batch_with_epoch_millis() {
        let batch = parse_detection_batch(
            br#"{"timestamp": 1700000000123, "detections": [{"box": [10.7, 20.2, 50.9, 90.0], "score": 0.82}]}"#,
        )
        .unwrap();
        assert_eq!(batch.captured_at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.detections[0].bbox, BoundingBox::new(10, 20, 50, 90));
        assert!(batch.detections[0].is_person());
    }

    #[test]
    fn batch_with_rfc3339() {
        let batch = parse_detection_batch(
            br#"{"timestamp": "2024-05-06T10:15:30+00:00", "detections": [{"box": [0,0,1,1], "score": 0.9, "label": "dog"}]}"#,
        )
        .unwrap();
        assert_eq!(batch.captured_at.timestamp(), 1_714_990_530);
        assert_eq!(batch.detections[0].label, "dog");
    }

    #[test]
    fn malformed_batch_is_an_error() {
        assert!(parse_detection_batch(b"{\"detections\": []}").is_err());
        assert!(parse_detection_batch(b"not json").is_err());
        assert!(parse_detection_batch(br#"{"timestamp": "yesterday"}"#).is_err());
    }

    #[test]
    fn garbage_jpeg_is_rejected() {
        assert!(decode_frame(&[0xff, 0xd8, 0x00], Local::now()).is_err());
    }
}
