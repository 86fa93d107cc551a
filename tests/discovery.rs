//! ACDS wire-level tests: registration, the IP-disclosure rule, the
//! password gate, TURN determinism and per-IP rate limiting.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use asciichat::config::Timeouts;
use asciichat::discovery::service::DiscoveryService;
use asciichat::discovery::words;
use asciichat::discovery::{Registry, RegistryConfig};
use asciichat::messages::{ErrorCode, SessionType, CAP_AUDIO, CAP_VIDEO};
use asciichat::sdk::{DiscoveryClient, DiscoveryClientError, HostAnnouncement};

async fn start_service(config: RegistryConfig) -> (Arc<DiscoveryService>, SocketAddr) {
    let registry = Arc::new(Registry::with_config(config));
    let service = DiscoveryService::new(registry, Timeouts::testing());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(service.clone().run(listener));
    (service, addr)
}

fn announcement(expose_ip: bool, password: Option<&str>) -> HostAnnouncement {
    HostAnnouncement {
        session_type: SessionType::DirectTcp,
        capabilities: CAP_VIDEO | CAP_AUDIO,
        max_participants: 100,
        server_addr: "192.168.1.100".into(),
        server_port: 27224,
        expose_ip,
        password: password.map(String::from),
    }
}

#[tokio::test]
async fn exposed_session_discloses_contact_info() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());

    let created = client.create(announcement(true, None)).await.unwrap();
    assert!(words::looks_like_session_string(&created.session_string));
    assert_eq!(created.ttl_secs, 3600);

    let joined = client.join(&created.session_string, None).await.unwrap();
    assert!(joined.success);
    assert_eq!(joined.error, ErrorCode::None);
    assert_eq!(joined.server_addr, "192.168.1.100");
    assert_eq!(joined.server_port, 27224);
}

#[tokio::test]
async fn unexposed_session_withholds_contact_info() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());

    let created = client.create(announcement(false, None)).await.unwrap();
    let joined = client.join(&created.session_string, None).await.unwrap();
    assert!(joined.success);
    assert_eq!(joined.error, ErrorCode::IpWithheld);
    assert!(joined.server_addr.is_empty());
    assert_eq!(joined.server_port, 0);
}

#[tokio::test]
async fn password_gate_over_the_wire() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());

    let created = client
        .create(announcement(false, Some("test-password-123")))
        .await
        .unwrap();

    let joined = client
        .join(&created.session_string, Some("test-password-123"))
        .await
        .unwrap();
    assert_eq!(joined.server_addr, "192.168.1.100");

    match client.join(&created.session_string, Some("wrong")).await {
        Err(DiscoveryClientError::Refused(code)) => {
            assert_eq!(code, ErrorCode::InvalidPassword)
        }
        other => panic!("expected refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_session_is_refused() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());
    match client.join("amberfox-mosswren-duskowl", None).await {
        Err(DiscoveryClientError::Refused(code)) => {
            assert_eq!(code, ErrorCode::SessionNotFound)
        }
        other => panic!("expected refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn turn_credentials_are_identical_across_joins() {
    let (_service, addr) = start_service(RegistryConfig {
        turn_secret: Some("turn-secret".into()),
        ..RegistryConfig::default()
    })
    .await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());

    let created = client
        .create(HostAnnouncement {
            session_type: SessionType::WebRtc,
            ..announcement(true, None)
        })
        .await
        .unwrap();

    let first = client.join(&created.session_string, None).await.unwrap();
    let second = client.join(&created.session_string, None).await.unwrap();
    assert!(!first.turn_username.is_empty());
    assert!(!first.turn_password.is_empty());
    assert_eq!(first.turn_username, second.turn_username);
    assert_eq!(first.turn_password, second.turn_password);
    assert!(first
        .turn_username
        .ends_with(&format!(":{}", created.session_string)));
}

#[tokio::test]
async fn join_flood_from_one_ip_is_rate_limited() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());
    let created = client.create(announcement(true, None)).await.unwrap();

    // The create consumed one token; the join burst exhausts the rest,
    // after which the registry answers RATE_LIMITED.
    let mut limited = false;
    for _ in 0..30 {
        match client.join(&created.session_string, None).await {
            Ok(_) => {}
            Err(DiscoveryClientError::Refused(ErrorCode::RateLimited)) => {
                limited = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(limited, "flood was never limited");
}

#[tokio::test]
async fn distinct_sessions_get_distinct_strings() {
    let (_service, addr) = start_service(RegistryConfig::default()).await;
    let client = DiscoveryClient::new(addr, Timeouts::testing());
    let first = client.create(announcement(true, None)).await.unwrap();
    let second = client.create(announcement(true, None)).await.unwrap();
    assert_ne!(first.session_string, second.session_string);
}
