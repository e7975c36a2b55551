//! Transport for push mode: frames and detections arrive over MQTT.

pub mod mqtt;

pub use mqtt::{
    decode_frame, parse_detection_batch, parse_mqtt_endpoint, route_message, run_push,
    MqttEndpoint, TlsMaterials,
};
