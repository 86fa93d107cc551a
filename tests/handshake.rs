//! Two-sided handshake exchanges over an in-memory duplex transport.

use asciichat::config::Timeouts;
use asciichat::crypto::hash_password;
use asciichat::crypto::identity::{IdentityKey, KnownHosts, NodeCredentials};
use asciichat::framing::Packet;
use asciichat::handshake::{ClientHandshake, HandshakeError, HandshakeOutcome, ServerHandshake};
use asciichat::messages::{
    ClientHello, ErrorCode, ErrorPayload, PacketType, CAP_AUDIO, CAP_VIDEO, HELLO_FLAG_ENCRYPT,
};
use asciichat::transport::{duplex_pair, Transport};

fn client_driver(password: Option<&str>, credentials: Option<NodeCredentials>) -> ClientHandshake {
    ClientHandshake {
        display_name: "alice".into(),
        capabilities: CAP_VIDEO | CAP_AUDIO,
        encrypt: true,
        credentials,
        password: password.map(String::from),
        known_hosts: None,
        server_host: "127.0.0.1".into(),
        server_port: 27224,
        timeouts: Timeouts::testing(),
    }
}

fn server_driver(assigned_id: u32) -> ServerHandshake {
    ServerHandshake {
        credentials: None,
        require_client_identity: false,
        authorized_keys: Vec::new(),
        password_hash: None,
        require_encryption: true,
        assigned_id,
        timeouts: Timeouts::testing(),
    }
}

async fn run_pair(
    client: ClientHandshake,
    server: ServerHandshake,
) -> (
    Result<HandshakeOutcome, HandshakeError>,
    Result<HandshakeOutcome, HandshakeError>,
) {
    let (mut client_transport, mut server_transport) = duplex_pair(&Timeouts::testing());
    let client_task = tokio::spawn(async move { client.run(&mut client_transport).await });
    let server_task = tokio::spawn(async move { server.run(&mut server_transport).await });
    let (client_res, server_res) = tokio::join!(client_task, server_task);
    (client_res.unwrap(), server_res.unwrap())
}

#[tokio::test]
async fn plain_handshake_reaches_ready_and_encrypts() {
    let (client, server) = run_pair(client_driver(None, None), server_driver(42)).await;
    let client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(client.client_id, 42);
    assert_eq!(server.peer_name, "alice");
    assert_eq!(server.peer_capabilities, CAP_VIDEO | CAP_AUDIO);
    assert!(client.channel.is_encrypted());

    // The derived channels interoperate: client seals a ping, server opens
    // it, and the reverse direction answers.
    let mut client_channel = client.channel;
    let mut server_channel = server.channel;
    let ping = client_channel
        .seal_packet(PacketType::Ping, b"nonce", 42)
        .unwrap();
    assert_eq!(&server_channel.open_packet(&ping).unwrap()[..], b"nonce");
    let pong = server_channel
        .seal_packet(PacketType::Pong, b"nonce", 0)
        .unwrap();
    assert_eq!(&client_channel.open_packet(&pong).unwrap()[..], b"nonce");
}

#[tokio::test]
async fn tampered_ciphertext_fails_authentication() {
    let (client, server) = run_pair(client_driver(None, None), server_driver(1)).await;
    let mut client_channel = client.unwrap().channel;
    let mut server_channel = server.unwrap().channel;

    let sealed = client_channel
        .seal_packet(PacketType::ImageFrame, b"frame bits", 1)
        .unwrap();
    let mut tampered = sealed.payload.to_vec();
    tampered[3] ^= 0x01;
    let forged = Packet::new(sealed.packet_type, sealed.client_id, tampered.into());
    assert!(server_channel.open_packet(&forged).is_err());
}

#[tokio::test]
async fn password_gate_admits_the_right_password() {
    let mut server = server_driver(7);
    server.password_hash = Some(hash_password("test-password-123"));
    let (client, server) = run_pair(client_driver(Some("test-password-123"), None), server).await;
    assert_eq!(client.unwrap().client_id, 7);
    assert!(server.is_ok());
}

#[tokio::test]
async fn password_gate_rejects_the_wrong_password() {
    let mut server = server_driver(7);
    server.password_hash = Some(hash_password("test-password-123"));
    let (client, server) = run_pair(client_driver(Some("wrong"), None), server).await;

    assert!(matches!(
        server.unwrap_err(),
        HandshakeError::PasswordRejected
    ));
    match client.unwrap_err() {
        HandshakeError::Remote(err) => assert_eq!(err.code, ErrorCode::InvalidPassword),
        other => panic!("unexpected client error: {other}"),
    }
}

#[tokio::test]
async fn client_identity_is_verified_against_the_trust_store() {
    let creds = NodeCredentials::from_seed(&[11u8; 32]);
    let mut server = server_driver(3);
    server.require_client_identity = true;
    server.authorized_keys = vec![IdentityKey(creds.public_bytes())];
    let (client, server) = run_pair(client_driver(None, Some(creds)), server).await;

    let server = server.unwrap();
    assert!(client.is_ok());
    assert_eq!(
        server.peer_identity,
        Some(IdentityKey(
            NodeCredentials::from_seed(&[11u8; 32]).public_bytes()
        ))
    );
}

#[tokio::test]
async fn unauthorized_client_identity_is_rejected() {
    let mut server = server_driver(3);
    server.require_client_identity = true;
    server.authorized_keys = vec![IdentityKey([9u8; 32])];
    let (client, server) = run_pair(
        client_driver(None, Some(NodeCredentials::from_seed(&[11u8; 32]))),
        server,
    )
    .await;

    assert!(matches!(
        server.unwrap_err(),
        HandshakeError::IdentityRejected(_)
    ));
    assert!(client.is_err());
}

#[tokio::test]
async fn missing_client_identity_is_rejected() {
    let mut server = server_driver(3);
    server.require_client_identity = true;
    let (client, server) = run_pair(client_driver(None, None), server).await;
    assert!(client.is_err());
    assert!(server.is_err());
}

#[tokio::test]
async fn known_hosts_pins_the_server_key() {
    let server_creds = NodeCredentials::from_seed(&[5u8; 32]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");

    // First contact records the key.
    let mut client = client_driver(None, None);
    client.known_hosts = Some(KnownHosts::load(&path).unwrap());
    let mut server = server_driver(1);
    server.credentials = Some(server_creds.clone());
    let (client_res, server_res) = run_pair(client, server).await;
    assert!(client_res.is_ok());
    assert!(server_res.is_ok());

    // An impostor with a different key is refused on reconnect.
    let mut client = client_driver(None, None);
    client.known_hosts = Some(KnownHosts::load(&path).unwrap());
    let mut server = server_driver(2);
    server.credentials = Some(NodeCredentials::from_seed(&[6u8; 32]));
    let (client_res, _server_res) = run_pair(client, server).await;
    assert!(matches!(
        client_res.unwrap_err(),
        HandshakeError::HostKeyMismatch { .. }
    ));
}

#[tokio::test]
async fn incompatible_version_is_refused_with_an_error_packet() {
    let (mut probe, mut server_transport) = duplex_pair(&Timeouts::testing());
    let server = server_driver(1);
    let server_task = tokio::spawn(async move { server.run(&mut server_transport).await });

    let hello = ClientHello {
        protocol_version: 99,
        capabilities: 0,
        flags: HELLO_FLAG_ENCRYPT,
        display_name: "future".into(),
    };
    probe
        .send_frame(&Packet::new(
            PacketType::ClientHello.as_u16(),
            0,
            hello.encode(),
        ))
        .await
        .unwrap();

    let reply = probe.recv_frame().await.unwrap();
    assert_eq!(reply.packet_type, PacketType::Error.as_u16());
    let err = ErrorPayload::decode(reply.payload).unwrap();
    assert_eq!(err.code, ErrorCode::IncompatibleVersion);
    assert!(matches!(
        server_task.await.unwrap().unwrap_err(),
        HandshakeError::IncompatibleVersion { remote: 99 }
    ));
}

#[tokio::test]
async fn plaintext_hello_is_refused_when_encryption_is_required() {
    let mut client = client_driver(None, None);
    client.encrypt = false;
    let (client_res, server_res) = run_pair(client, server_driver(1)).await;

    assert!(matches!(
        server_res.unwrap_err(),
        HandshakeError::Policy(_)
    ));
    match client_res.unwrap_err() {
        HandshakeError::Remote(err) => {
            assert_eq!(err.code, ErrorCode::EncryptionPolicyViolation)
        }
        other => panic!("unexpected client error: {other}"),
    }
}

#[tokio::test]
async fn optional_encryption_yields_a_plaintext_channel() {
    let mut client = client_driver(None, None);
    client.encrypt = false;
    let mut server = server_driver(4);
    server.require_encryption = false;
    let (client_res, server_res) = run_pair(client, server).await;

    let client_outcome = client_res.unwrap();
    assert!(!client_outcome.channel.is_encrypted());
    assert!(!server_res.unwrap().channel.is_encrypted());
}
