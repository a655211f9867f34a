mod common;

use common::{audit_events, eventually, tls_session, ClientIdentity, ConnectOptions, Harness, MqttClient};
use locus::domain::DeviceIdentity;
use locus::listeners::ProtocolTransport;
use locus::time::OffsetClock;
use std::sync::Arc;

fn rejections_for(reason: &str) -> usize {
    audit_events("tls_handshake_rejected")
        .into_iter()
        .filter(|e| e.message.contains(&format!("reason={reason}")))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn certificate_session_records_location() {
    let harness = Harness::start().await;
    let alice = harness.issue("alice");

    let (mut client, code) = tls_session(harness.tls_port(), &alice, "phone1")
        .await
        .expect("tls session");
    assert_eq!(code, 0);
    client
        .publish_acked(
            "owntracks/alice/phone1",
            br#"{"_type":"location","lat":37.7749,"lon":-122.4194,"tst":1700000000,"acc":12}"#,
            7,
        )
        .await
        .expect("location acknowledged");

    let phone = DeviceIdentity::new("alice", "phone1");
    let locations = harness.store.locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].0, phone);
    assert_eq!(locations[0].1.lat, 37.7749);
    assert_eq!(locations[0].1.acc, Some(12.0));
    assert_eq!(harness.store.is_online(&phone), Some(true));

    client.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn revoked_certificate_is_refused_at_handshake() {
    let harness = Harness::start().await;
    let alice = harness.issue("alice");

    let (mut established, code) = tls_session(harness.tls_port(), &alice, "phone1")
        .await
        .expect("tls session");
    assert_eq!(code, 0);

    let before = rejections_for("revoked");
    harness
        .runtime
        .pki()
        .revoke_client_certificate(&alice.serial)
        .expect("revoke");

    // Under TLS 1.3 the client may finish its side before the server
    // rejects the certificate, so the refusal can surface on first read.
    let refused = tls_session(harness.tls_port(), &alice, "phone2").await;
    assert!(refused.is_err(), "revoked certificate was admitted");
    assert!(eventually(|| rejections_for("revoked") > before).await);

    // Sessions established before the revocation keep running.
    established.ping().await.expect("existing session still alive");
    established.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_revocation_list_admits_valid_certificates() {
    let harness = Harness::start().await;
    let crl = harness.runtime.pki().current_revocation_list();
    assert!(crl.is_signed());
    assert!(crl.revoked_serials.is_empty());

    let alice = harness.issue("alice");
    let (client, code) = tls_session(harness.tls_port(), &alice, "phone1")
        .await
        .expect("tls session");
    assert_eq!(code, 0);
    client.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn certificate_without_known_owner_is_not_authorized() {
    let harness = Harness::start().await;
    let carol = harness.issue("carol");

    let (_client, code) = tls_session(harness.tls_port(), &carol, "laptop")
        .await
        .expect("tls session");
    assert_eq!(code, 5);
    assert!(audit_events("connect_rejected")
        .iter()
        .any(|e| e.identity == "carol" && e.message.starts_with("not_authorized")));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn certificate_from_previous_authority_is_untrusted() {
    let harness = Harness::start().await;
    let alice = harness.issue("alice");

    let pki = harness.runtime.pki();
    pki.generate_authority("Rotated CA", 3650, 256).unwrap();
    pki.generate_server_certificate("locus", 365, 256, &[]).unwrap();
    let rotated_ca = pki.active_authority_pem().unwrap();

    let before = rejections_for("untrusted_chain");
    let stale = ClientIdentity {
        ca_pem: rotated_ca.clone(),
        ..alice
    };
    assert!(tls_session(harness.tls_port(), &stale, "phone1").await.is_err());
    assert!(eventually(|| rejections_for("untrusted_chain") > before).await);

    // A certificate from the new authority is accepted by the rebuilt listener.
    let fresh = harness.issue("alice");
    assert_eq!(fresh.ca_pem, rotated_ca);
    let (client, code) = tls_session(harness.tls_port(), &fresh, "phone1")
        .await
        .expect("tls session");
    assert_eq!(code, 0);
    client.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_client_certificate_is_refused_when_required() {
    let harness = Harness::start().await;
    let ca = harness.runtime.pki().active_authority_pem().unwrap();
    let before = rejections_for("missing_client_certificate");

    let anonymous = ClientIdentity::anonymous(&ca);
    assert!(tls_session(harness.tls_port(), &anonymous, "phone1").await.is_err());
    assert!(eventually(|| rejections_for("missing_client_certificate") > before).await);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn optional_client_certificate_falls_back_to_credentials() {
    let harness = Harness::start_with(|cfg| {
        cfg.listeners.require_client_certificate = false;
    })
    .await;
    let ca = harness.runtime.pki().active_authority_pem().unwrap();

    let mut client = MqttClient::tls(harness.tls_port(), &ClientIdentity::anonymous(&ca))
        .await
        .expect("tls connect");
    let code = client
        .connect(&ConnectOptions::new("bob-phone").credentials("bob", b"bob-pw"))
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert!(audit_events("session_connected")
        .iter()
        .any(|e| e.identity == "bob" && e.message.contains("transport=tls")));
    client.disconnect().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn certificate_identity_wins_over_username() {
    let harness = Harness::start().await;
    let alice = harness.issue("alice");

    let mut client = MqttClient::tls(harness.tls_port(), &alice).await.unwrap();
    let code = client
        .connect(&ConnectOptions::new("phone1").credentials("bob", b"wrong"))
        .await
        .unwrap();
    assert_eq!(code, 0);
    // The session acts as alice, so bob's namespace stays closed.
    let grants = client
        .subscribe(1, &[("owntracks/alice/#", 1), ("owntracks/bob/#", 1)])
        .await
        .unwrap();
    assert_eq!(grants, vec![1, 0x80]);
    client.disconnect().await.unwrap();

    assert_eq!(
        harness.runtime.listeners().state(ProtocolTransport::Tls),
        locus::listeners::ListenerState::Listening
    );
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn revocation_written_by_another_manager_is_enforced() {
    let harness = Harness::start().await;
    let alice = harness.issue("alice");
    let trust = harness.runtime.trust();
    let before_generation = trust.snapshot().unwrap().generation;
    let before = rejections_for("revoked");

    // Same store, separate manager: what the CLI does against a live broker.
    let admin = harness.admin_pki();
    admin.revoke_client_certificate(&alice.serial).expect("revoke");
    assert!(eventually(|| trust.snapshot().unwrap().generation > before_generation).await);

    assert!(tls_session(harness.tls_port(), &alice, "phone1").await.is_err());
    assert!(eventually(|| rejections_for("revoked") > before).await);

    // Later broker writes build on the revocation instead of undoing it.
    harness
        .runtime
        .pki()
        .issue_client_certificate("bob", 30, 256)
        .expect("issue bob");
    let on_disk = harness.admin_pki().list_client_certificates(Some("alice"));
    assert_eq!(on_disk.len(), 1);
    assert!(on_disk[0].revoked);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_certificate_is_refused_at_handshake() {
    let clock = Arc::new(OffsetClock::new());
    clock.set_offset(chrono::Duration::days(-10));
    let harness = Harness::start_with_clock(clock.clone(), |_| {}).await;
    let issued = harness
        .runtime
        .pki()
        .issue_client_certificate("alice", 1, 256)
        .expect("issue");
    clock.set_offset(chrono::Duration::zero());
    let alice = ClientIdentity::from_issued(&issued);

    let before = rejections_for("expired");
    assert!(tls_session(harness.tls_port(), &alice, "phone1").await.is_err());
    assert!(eventually(|| rejections_for("expired") > before).await);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rsa_authority_serves_tls_sessions() {
    let harness = Harness::start_with(|cfg| cfg.pki.key_size = 2048).await;
    let issued = harness
        .runtime
        .pki()
        .issue_client_certificate("alice", 30, 2048)
        .expect("issue rsa client certificate");
    let alice = ClientIdentity::from_issued(&issued);

    let (client, code) = tls_session(harness.tls_port(), &alice, "phone1")
        .await
        .expect("tls session");
    assert_eq!(code, 0);
    client.disconnect().await.unwrap();
    harness.stop().await;
}
