mod common;

use common::{audit_events, eventually, ConnectOptions, Harness, MqttClient};
use locus::domain::{CommandVerb, DeviceIdentity};
use serde_json::{json, Value};
use std::time::Duration;

async fn login(port: u16, client_id: &str, user: &str, password: &[u8]) -> MqttClient {
    let mut client = MqttClient::tcp(port).await.expect("tcp connect");
    let code = client
        .connect(&ConnectOptions::new(client_id).credentials(user, password))
        .await
        .expect("connack");
    assert_eq!(code, 0, "{user} refused");
    client
}

async fn connack_code(port: u16, opts: ConnectOptions) -> u8 {
    let mut client = MqttClient::tcp(port).await.expect("tcp connect");
    client.connect(&opts).await.expect("connack")
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_refusals_use_distinct_codes() {
    let harness = Harness::start().await;
    let port = harness.plain_port();

    let bad_password = ConnectOptions::new("c1").credentials("alice", b"nope");
    assert_eq!(connack_code(port, bad_password).await, 4);

    let unknown_user = ConnectOptions::new("c2").credentials("mallory", b"x");
    assert_eq!(connack_code(port, unknown_user).await, 4);

    assert_eq!(connack_code(port, ConnectOptions::new("c3")).await, 5);

    let mut legacy = ConnectOptions::new("c4").credentials("alice", b"alice-pw");
    legacy.protocol_level = 3;
    assert_eq!(connack_code(port, legacy).await, 1);

    let mut empty_id = ConnectOptions::new("").credentials("alice", b"alice-pw");
    empty_id.clean_session = false;
    assert_eq!(connack_code(port, empty_id).await, 2);

    assert!(audit_events("connect_rejected")
        .iter()
        .any(|e| e.identity == "alice" && e.message.starts_with("bad_username_or_password")));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn anonymous_sessions_get_their_own_namespace() {
    let harness = Harness::start_with(|cfg| cfg.broker.allow_anonymous = true).await;
    let mut client = MqttClient::tcp(harness.plain_port()).await.unwrap();
    assert_eq!(client.connect(&ConnectOptions::new("guest")).await.unwrap(), 0);

    let grants = client
        .subscribe(1, &[("owntracks/anonymous/#", 0), ("owntracks/alice/#", 0)])
        .await
        .unwrap();
    assert_eq!(grants, vec![0, 0x80]);
    client.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_namespace_publish_is_dropped_but_session_survives() {
    let harness = Harness::start().await;
    let port = harness.plain_port();

    let mut bob = login(port, "bob-phone", "bob", b"bob-pw").await;
    assert_eq!(bob.subscribe(1, &[("owntracks/bob/#", 1)]).await.unwrap(), vec![1]);

    let mut alice = login(port, "alice-phone", "alice", b"alice-pw").await;
    // The denied QoS 1 publish is still acknowledged.
    alice
        .publish_acked("owntracks/bob/phone", br#"{"lat":1.0,"lon":2.0}"#, 3)
        .await
        .expect("denied publish acknowledged");
    assert!(audit_events("publish_denied")
        .iter()
        .any(|e| e.identity == "alice" && e.message == "owntracks/bob/phone"));

    assert!(bob.expect_silence(Duration::from_millis(300)).await);
    assert!(harness.store.locations().is_empty());

    // The session is still usable for its own namespace.
    alice
        .publish_acked("owntracks/alice/phone", br#"{"lat":1.0,"lon":2.0}"#, 4)
        .await
        .unwrap();
    let locations = harness.store.locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].0, DeviceIdentity::new("alice", "phone"));

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_are_confined_and_capped_at_qos1() {
    let harness = Harness::start().await;
    let mut alice = login(harness.plain_port(), "alice-web", "alice", b"alice-pw").await;

    let grants = alice
        .subscribe(
            1,
            &[
                ("owntracks/alice/#", 2),
                ("owntracks/alice/+/event", 0),
                ("owntracks/#", 1),
                ("owntracks/bob/phone", 1),
                ("#", 0),
            ],
        )
        .await
        .unwrap();
    assert_eq!(grants, vec![1, 0, 0x80, 0x80, 0x80]);
    assert!(audit_events("subscribe_denied")
        .iter()
        .any(|e| e.identity == "alice" && e.message == "owntracks/bob/phone"));

    alice.unsubscribe(2, &["owntracks/alice/#"]).await.unwrap();
    alice.ping().await.unwrap();
    alice.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_respects_granted_qos_and_excludes_publisher() {
    let harness = Harness::start().await;
    let port = harness.plain_port();

    let mut watcher = login(port, "alice-web", "alice", b"alice-pw").await;
    watcher.subscribe(1, &[("owntracks/alice/#", 1)]).await.unwrap();
    let mut phone = login(port, "alice-phone", "alice", b"alice-pw").await;
    phone.subscribe(1, &[("owntracks/alice/#", 0)]).await.unwrap();

    let body = br#"{"_type":"location","lat":48.85,"lon":2.35}"#;
    phone.publish("owntracks/alice/phone", body, 0, 0).await.unwrap();
    let received = watcher.expect_publish().await.unwrap();
    assert_eq!(received.topic, "owntracks/alice/phone");
    assert_eq!(received.qos, 0);
    assert_eq!(received.payload, body.to_vec());

    phone.publish_acked("owntracks/alice/phone", body, 9).await.unwrap();
    let received = watcher.expect_publish().await.unwrap();
    assert_eq!(received.qos, 1);
    assert!(!received.dup);
    let mid = received.message_id.expect("qos1 delivery has an id");
    watcher.puback(mid).await.unwrap();

    // The publisher's own subscription never echoes its publishes.
    assert!(phone.expect_silence(Duration::from_millis(300)).await);

    assert!(eventually(|| harness.store.locations().len() == 2).await);
    watcher.disconnect().await.unwrap();
    phone.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unacknowledged_delivery_is_resent_with_dup() {
    let harness = Harness::start().await;
    let port = harness.plain_port();

    let mut watcher = login(port, "alice-web", "alice", b"alice-pw").await;
    watcher.subscribe(1, &[("owntracks/alice/+/event", 1)]).await.unwrap();
    let mut phone = login(port, "alice-phone", "alice", b"alice-pw").await;

    let event = br#"{"_type":"transition","event":"enter","desc":"home","tst":1700000000}"#;
    phone
        .publish_acked("owntracks/alice/phone/event", event, 1)
        .await
        .unwrap();

    let first = watcher.expect_publish().await.unwrap();
    assert!(!first.dup);
    let again = watcher.expect_publish().await.unwrap();
    assert!(again.dup);
    assert_eq!(again.message_id, first.message_id);
    assert_eq!(again.payload, first.payload);
    watcher.puback(first.message_id.unwrap()).await.unwrap();

    // Acknowledged: no third copy.
    assert!(watcher.expect_silence(Duration::from_millis(1_500)).await);
    watcher.disconnect().await.unwrap();
    phone.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_reach_the_device_topic() {
    let harness = Harness::start().await;
    let mut phone = login(harness.plain_port(), "alice-phone", "alice", b"alice-pw").await;
    assert_eq!(
        phone.subscribe(1, &[("owntracks/alice/phone/cmd", 1)]).await.unwrap(),
        vec![1]
    );

    let delivered = harness
        .runtime
        .commands()
        .build_and_publish_command("alice", "phone", CommandVerb::ReportLocation, None, None)
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let command = phone.expect_publish().await.unwrap();
    assert_eq!(command.topic, "owntracks/alice/phone/cmd");
    assert_eq!(command.qos, 1);
    let body: Value = serde_json::from_slice(&command.payload).unwrap();
    assert_eq!(body, json!({"_type": "cmd", "action": "reportLocation"}));
    phone.puback(command.message_id.unwrap()).await.unwrap();

    // Devices cannot forge commands for each other.
    phone
        .publish_acked("owntracks/bob/phone/cmd", br#"{"_type":"cmd","action":"dump"}"#, 5)
        .await
        .unwrap();
    assert!(audit_events("publish_denied")
        .iter()
        .any(|e| e.message == "owntracks/bob/phone/cmd"));

    phone.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_session_records_location() {
    let harness = Harness::start().await;
    let mut client = MqttClient::ws(harness.ws_port()).await.expect("websocket upgrade");
    let code = client
        .connect(&ConnectOptions::new("alice-browser").credentials("alice", b"alice-pw"))
        .await
        .expect("connack");
    assert_eq!(code, 0);
    client
        .publish_acked(
            "owntracks/alice/browser",
            br#"{"_type":"location","lat":52.52,"lon":13.405,"tst":1700000000}"#,
            2,
        )
        .await
        .expect("location acknowledged");

    let locations = harness.store.locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].0, DeviceIdentity::new("alice", "browser"));
    assert!(audit_events("session_connected")
        .iter()
        .any(|e| e.identity == "alice" && e.message.contains("transport=ws")));

    client.disconnect().await.unwrap();
    harness.stop().await;
}
