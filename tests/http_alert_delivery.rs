use std::time::Duration;

use chrono::{Local, TimeZone};

use teatime_edge::alert::{AlertDispatcher, AlertPayload, DispatchOutcome, HttpAlertSink};
use teatime_edge::receiver::{AlertReceiver, DisplayState, ReceiverConfig};

fn spawn_receiver() -> teatime_edge::ReceiverHandle {
    AlertReceiver::new(ReceiverConfig {
        addr: "127.0.0.1:0".to_string(),
        display_duration: Duration::from_secs(60),
        windows: vec!["10:00 - 12:00".to_string()],
    })
    .spawn()
    .expect("spawn receiver")
}

#[test]
fn alert_is_delivered_and_displayed() {
    let handle = spawn_receiver();
    let url = format!("http://{}/alert", handle.addr);
    let mut sink = HttpAlertSink::new(url, Duration::from_secs(5));

    assert!(matches!(handle.display_state().unwrap(), DisplayState::Idle { .. }));

    let at = Local.with_ymd_and_hms(2024, 6, 3, 10, 42, 7).unwrap();
    let outcome = sink.dispatch(&AlertPayload::new(0.87, at));
    assert_eq!(outcome, DispatchOutcome::Delivered);
    assert_eq!(
        handle.display_state().unwrap(),
        DisplayState::Alert {
            time: "10:42".to_string()
        }
    );

    handle.stop().unwrap();
}

#[test]
fn unknown_event_is_rejected_with_400() {
    let handle = spawn_receiver();
    let mut sink = HttpAlertSink::new(format!("http://{}/alert", handle.addr), Duration::from_secs(5));

    let mut payload = AlertPayload::new(0.5, Local::now());
    payload.event = "coffee_spilled".to_string();
    assert_eq!(sink.dispatch(&payload), DispatchOutcome::Rejected(400));
    assert!(matches!(handle.display_state().unwrap(), DisplayState::Idle { .. }));

    handle.stop().unwrap();
}

#[test]
fn receiver_answers_liveness_and_method_checks() {
    let handle = spawn_receiver();
    let base = format!("http://{}", handle.addr);

    let body = ureq::get(&format!("{}/", base))
        .call()
        .expect("root")
        .into_string()
        .expect("body");
    assert_eq!(body, "TeaTime IoT Node Online");

    match ureq::get(&format!("{}/alert", base)).call() {
        Err(ureq::Error::Status(code, _)) => assert_eq!(code, 405),
        other => panic!("expected 405, got {:?}", other.map(|r| r.status())),
    }

    let status = ureq::get(&format!("{}/status", base))
        .call()
        .expect("status")
        .into_string()
        .expect("body");
    let status: serde_json::Value = serde_json::from_str(&status).expect("json");
    assert_eq!(status["display"]["mode"], "idle");
    assert_eq!(status["alerts_received"], 0);

    handle.stop().unwrap();
}

#[test]
fn closed_receiver_reports_failure() {
    let handle = spawn_receiver();
    let url = format!("http://{}/alert", handle.addr);
    handle.stop().unwrap();

    let mut sink = HttpAlertSink::new(url, Duration::from_secs(1));
    let outcome = sink.dispatch(&AlertPayload::new(0.9, Local::now()));
    assert!(matches!(outcome, DispatchOutcome::Failed(_)));
}
