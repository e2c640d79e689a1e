//! Session bootstrap and resume against a scripted API and socket server.
//!
//! Run with: cargo test --test integration_session

mod common;

use common::{next_matching, test_client, test_config, FakeApi, FakeServer, TEST_RSA_BITS};
use monkey_core::crypto::{KeyExchange, RsaKeyExchange};
use monkey_core::transport::{HttpMethod, TransportError};
use monkey_core::{KeyMaterial, MonkeyError, MonkeyEvent, ProtocolCommand, SessionState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_new_session_bootstrap() {
    let server_keys = RsaKeyExchange::with_bits(TEST_RSA_BITS)
        .generate_keypair()
        .expect("server keypair");
    let server_public = server_keys.public_key_pem.clone();

    let api = FakeApi::new();
    api.route("/user/session", move |_| {
        Ok(json!({ "monkeyId": "u1", "publicKey": server_public.clone() }))
    });
    api.route("/user/connect", |_| Ok(Value::Null));

    let (server, mut accepted) = FakeServer::new();
    let client = test_client(test_config(), api.clone(), server.clone());
    let mut events = client.subscribe_events();

    let session_id = assert_ok!(client.init().await);
    assert_eq!(session_id, "u1");
    assert_eq!(client.session_id().as_deref(), Some("u1"));

    // The handshake announced no prior session
    let session_req = api.request_to("/user/session").expect("session request");
    assert_eq!(session_req.method, HttpMethod::Post);
    assert_eq!(session_req.body.as_ref().unwrap()["session_id"], Value::Null);

    // The connect POST carries our key, readable only with the server's private key
    let connect = api.request_to("/user/connect").expect("connect request");
    let body = connect.body.expect("connect body");
    assert_eq!(body["monkey_id"], "u1");
    let usk = body["usk"].as_str().expect("usk string");
    let pair = RsaKeyExchange::with_bits(TEST_RSA_BITS)
        .decrypt_with(&server_keys, usk)
        .expect("usk decrypts with the server key");
    let sent = KeyMaterial::parse_pair(std::str::from_utf8(&pair).unwrap()).expect("key:iv");
    assert_eq!(client.key_store().get("u1"), Some(sent));
    assert!(!api.paths().contains(&"/user/key/sync".to_string()));

    // Then the socket opens for u1 and asks for the backlog
    let mut end = accepted.recv().await.expect("socket connection");
    assert_eq!(
        server.urls(),
        vec!["wss://monkey.test/websockets?monkey_id=u1&p=A:B".to_string()]
    );
    let pending = end.next_frame().await;
    assert_eq!(pending.command(), ProtocolCommand::Sync);
    assert_eq!(pending.args["since"], 0);

    assert_eq!(
        next_matching(&mut events, |e| matches!(e, MonkeyEvent::Session { .. })).await,
        MonkeyEvent::Session { session_id: "u1".into() }
    );
    next_matching(&mut events, |e| matches!(e, MonkeyEvent::Connect { .. })).await;
    assert_eq!(client.state(), SessionState::Online);

    client.disconnect().await;
    assert_eq!(client.state(), SessionState::Offline);
}

#[tokio::test]
async fn test_session_resume_syncs_keys_before_socket() {
    let stored = KeyMaterial::new("c3RvcmVkLWtleS1zdG9yZWQta2V5LXN0b3JlZC1rZXk=", "aXZpdml2aXZpdml2aXZpdg==");
    let stored_pair = stored.to_pair();

    let api = FakeApi::new();
    api.route("/user/session", |req| {
        assert_eq!(req.body.as_ref().unwrap()["session_id"], "u1");
        Ok(json!({ "monkeyId": "u1", "publicKey": "unused" }))
    });
    api.route("/user/key/sync", move |req| {
        let body = req.body.as_ref().unwrap();
        assert_eq!(body["monkey_id"], "u1");
        let client_public = body["public_key"].as_str().unwrap();
        let keys = RsaKeyExchange::with_bits(TEST_RSA_BITS)
            .encrypt_for(client_public, stored_pair.as_bytes())
            .unwrap();
        Ok(json!({ "keys": keys, "last_time_synced": 1700, "last_message_id": "88" }))
    });

    let mut config = test_config();
    config.user_object = json!({ "monkey_id": "u1", "name": "Ana" });

    let (server, mut accepted) = FakeServer::new();
    let client = test_client(config, api.clone(), server);

    assert_eq!(assert_ok!(client.init().await), "u1");

    assert!(api.paths().contains(&"/user/key/sync".to_string()));
    assert!(!api.paths().contains(&"/user/connect".to_string()));
    assert_eq!(client.key_store().get("u1"), Some(stored));
    assert_eq!(client.high_water_marks(), (1700, 88));

    // The first backlog request already uses the synced mark
    let mut end = accepted.recv().await.expect("socket connection");
    let pending = end.next_frame().await;
    assert_eq!(pending.args["since"], 1700);

    client.disconnect().await;
}

#[tokio::test]
async fn test_failed_handshake_leaves_client_offline() {
    let api = FakeApi::new();
    api.route("/user/session", |_| {
        Err(TransportError::Status {
            status: 500,
            body: "down".into(),
        })
    });

    let (server, _accepted) = FakeServer::new();
    let client = test_client(test_config(), api.clone(), server.clone());

    let err = client.init().await.unwrap_err();
    assert!(matches!(err, MonkeyError::Transport(TransportError::Status { status: 500, .. })));
    assert_eq!(client.state(), SessionState::Offline);
    assert_eq!(client.session_id(), None);
    assert!(server.urls().is_empty());

    // A second init after the server recovers succeeds
    let server_keys = RsaKeyExchange::with_bits(TEST_RSA_BITS).generate_keypair().unwrap();
    let server_public = server_keys.public_key_pem.clone();
    api.route("/user/session", move |_| {
        Ok(json!({ "monkeyId": "u2", "publicKey": server_public.clone() }))
    });
    api.route("/user/connect", |_| Ok(Value::Null));

    assert_eq!(assert_ok!(client.init().await), "u2");
    client.disconnect().await;
}

#[tokio::test]
async fn test_failed_connect_allows_init_with_new_id() {
    let server_keys = RsaKeyExchange::with_bits(TEST_RSA_BITS).generate_keypair().unwrap();
    let server_public = server_keys.public_key_pem.clone();

    // Each handshake hands out a fresh id: u1, then u2
    let handshakes = Arc::new(AtomicUsize::new(0));
    let api = FakeApi::new();
    let counter = handshakes.clone();
    api.route("/user/session", move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "monkeyId": format!("u{}", n), "publicKey": server_public.clone() }))
    });
    api.route("/user/connect", |_| {
        Err(TransportError::Status {
            status: 500,
            body: "down".into(),
        })
    });

    let (server, _accepted) = FakeServer::new();
    let client = test_client(test_config(), api.clone(), server.clone());

    let err = client.init().await.unwrap_err();
    assert!(matches!(err, MonkeyError::Transport(TransportError::Status { status: 500, .. })));
    assert_eq!(client.state(), SessionState::Offline);
    assert_eq!(client.session_id(), None);
    assert!(!client.key_store().contains("u1"));
    assert!(server.urls().is_empty());

    api.route("/user/connect", |_| Ok(Value::Null));

    assert_eq!(assert_ok!(client.init().await), "u2");
    assert_eq!(client.session_id().as_deref(), Some("u2"));
    assert!(client.key_store().contains("u2"));
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_server_assigned_new_id_starts_fresh_session() {
    let server_keys = RsaKeyExchange::with_bits(TEST_RSA_BITS).generate_keypair().unwrap();
    let server_public = server_keys.public_key_pem.clone();

    let api = FakeApi::new();
    api.route("/user/session", move |_| {
        Ok(json!({ "monkeyId": "u9", "publicKey": server_public.clone() }))
    });
    api.route("/user/connect", |_| Ok(Value::Null));

    let mut config = test_config();
    config.session_id = Some("expired".into());

    let (server, _accepted) = FakeServer::new();
    let client = test_client(config, api.clone(), server);

    assert_eq!(assert_ok!(client.init().await), "u9");
    assert!(api.paths().contains(&"/user/connect".to_string()));
    assert!(client.key_store().contains("u9"));

    client.disconnect().await;
}
