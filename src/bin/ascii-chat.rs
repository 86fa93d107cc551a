//! ascii-chat entry point: media server, terminal client plumbing, and the
//! ACDS discovery daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use asciichat::config::Timeouts;
use asciichat::crypto::identity::NodeCredentials;
use asciichat::crypto::hash_password;
use asciichat::discovery::service::DiscoveryService;
use asciichat::discovery::words;
use asciichat::discovery::{Registry, RegistryConfig};
use asciichat::messages::{SessionType, SUB_AUDIO, SUB_VIDEO};
use asciichat::sdk::{AsciiChatClient, ClientError, ClientEvent, ClientOptions, DiscoveryClient,
    HostAnnouncement};
use asciichat::server::{Server, ServerConfig};
use asciichat::KnownHosts;

const EXIT_CONFIG: u8 = 1;
const EXIT_NETWORK: u8 = 2;
const EXIT_CRYPTO: u8 = 3;

#[derive(Parser)]
#[command(name = "ascii-chat", about = "Terminal video chat over ACIP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a media distribution server.
    Server {
        #[arg(long, default_value_t = 27224)]
        port: u16,
        /// Register this server with a discovery service.
        #[arg(long)]
        discovery: bool,
        /// Discovery service to register with (HOST:PORT).
        #[arg(long, default_value = "127.0.0.1:27225")]
        discovery_service: SocketAddr,
        /// Allow the registry to disclose this server's address to
        /// passwordless joiners.
        #[arg(long)]
        discovery_expose_ip: bool,
        /// Address announced to the registry.
        #[arg(long, default_value = "127.0.0.1")]
        advertise_addr: String,
        /// Password protecting the session (hashed before it leaves this
        /// process).
        #[arg(long)]
        password: Option<String>,
        /// Identity seed file (64 hex chars) for host authentication.
        #[arg(long)]
        identity: Option<PathBuf>,
        #[arg(long, default_value_t = 16)]
        max_participants: u16,
    },
    /// Join a session by three-word session string or by host:port.
    Client {
        /// Session string (amberfox-mosswren-duskowl) or HOST:PORT.
        target: String,
        /// Discovery service used to resolve session strings.
        #[arg(long, default_value = "127.0.0.1:27225")]
        discovery_service: SocketAddr,
        /// Prefer a WebRTC transport when the session offers one.
        #[arg(long)]
        prefer_webrtc: bool,
        /// Skip payload encryption (the server must allow it).
        #[arg(long)]
        no_encrypt: bool,
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value = "anonymous")]
        name: String,
        /// Known-hosts file for server identity pinning.
        #[arg(long)]
        known_hosts: Option<PathBuf>,
    },
    /// Run the ACDS discovery registry daemon.
    DiscoveryService {
        /// Addresses to bind.
        #[arg(required = true)]
        bind_addrs: Vec<std::net::IpAddr>,
        #[arg(long, default_value_t = 27225)]
        port: u16,
        /// File the registry persists session records to.
        #[arg(long)]
        database: Option<PathBuf>,
        /// Shared secret for deriving TURN credentials.
        #[arg(long)]
        turn_secret: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            port,
            discovery,
            discovery_service,
            discovery_expose_ip,
            advertise_addr,
            password,
            identity,
            max_participants,
        } => {
            run_server(
                port,
                discovery,
                discovery_service,
                discovery_expose_ip,
                advertise_addr,
                password,
                identity,
                max_participants,
            )
            .await
        }
        Command::Client {
            target,
            discovery_service,
            prefer_webrtc,
            no_encrypt,
            password,
            name,
            known_hosts,
        } => {
            run_client(
                target,
                discovery_service,
                prefer_webrtc,
                no_encrypt,
                password,
                name,
                known_hosts,
            )
            .await
        }
        Command::DiscoveryService {
            bind_addrs,
            port,
            database,
            turn_secret,
        } => run_discovery(bind_addrs, port, database, turn_secret).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    port: u16,
    discovery: bool,
    discovery_service: SocketAddr,
    discovery_expose_ip: bool,
    advertise_addr: String,
    password: Option<String>,
    identity: Option<PathBuf>,
    max_participants: u16,
) -> ExitCode {
    let timeouts = Timeouts::from_env();
    let credentials = match identity {
        Some(path) => match NodeCredentials::load_seed_file(&path) {
            Ok(creds) => Some(creds),
            Err(err) => {
                error!(error = %err, "could not load identity seed");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => None,
    };

    let config = ServerConfig {
        credentials,
        password_hash: password.as_deref().map(hash_password),
        timeouts,
        ..ServerConfig::default()
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, port, "could not bind server port");
            return ExitCode::from(EXIT_NETWORK);
        }
    };

    if discovery {
        let client = DiscoveryClient::new(discovery_service, timeouts);
        let announcement = HostAnnouncement {
            session_type: SessionType::DirectTcp,
            capabilities: 0,
            max_participants,
            server_addr: advertise_addr,
            server_port: port,
            expose_ip: discovery_expose_ip,
            password,
        };
        match client.create(announcement).await {
            Ok(created) => info!(
                session = %created.session_string,
                ttl_secs = created.ttl_secs,
                "registered with discovery service"
            ),
            Err(err) => {
                error!(error = %err, "discovery registration failed");
                return ExitCode::from(EXIT_NETWORK);
            }
        }
    }

    let server = Server::new(config);
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    match server.run(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server terminated");
            ExitCode::from(EXIT_NETWORK)
        }
    }
}

async fn run_client(
    target: String,
    discovery_service: SocketAddr,
    prefer_webrtc: bool,
    no_encrypt: bool,
    password: Option<String>,
    name: String,
    known_hosts: Option<PathBuf>,
) -> ExitCode {
    if prefer_webrtc {
        info!("webrtc transport not linked into this build; using direct TCP");
    }
    let known_hosts = match known_hosts {
        Some(path) => match KnownHosts::load(path) {
            Ok(hosts) => Some(hosts),
            Err(err) => {
                error!(error = %err, "could not load known-hosts file");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => None,
    };
    let options = ClientOptions {
        display_name: name,
        encrypt: !no_encrypt,
        password: password.clone(),
        known_hosts,
        ..ClientOptions::default()
    };

    let connected = if words::looks_like_session_string(&target) {
        AsciiChatClient::connect_session(
            discovery_service,
            &target,
            password.as_deref(),
            options,
        )
        .await
    } else {
        let resolved = tokio::net::lookup_host(target.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());
        match resolved {
            Some(addr) => AsciiChatClient::connect(addr, options).await,
            None => {
                error!(input = %target, "target is neither a session string nor HOST:PORT");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    };
    let mut client = match connected {
        Ok(client) => client,
        Err(err) => return client_failure(err),
    };
    info!(
        client_id = client.client_id(),
        encrypted = client.is_encrypted(),
        "joined session"
    );
    if let Err(err) = client.subscribe(SUB_VIDEO | SUB_AUDIO).await {
        return client_failure(err);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = client.leave().await;
                return ExitCode::SUCCESS;
            }
            event = client.next_event() => match event {
                Ok(ClientEvent::PeerJoined(join)) => {
                    info!(peer = join.client_id, name = %join.display_name, "peer joined");
                }
                Ok(ClientEvent::PeerLeft(leave)) => {
                    info!(peer = leave.client_id, reason = %leave.reason, "peer left");
                }
                Ok(ClientEvent::Image { origin, frame }) => {
                    info!(
                        origin,
                        width = frame.width,
                        height = frame.height,
                        "image frame"
                    );
                }
                Ok(ClientEvent::Audio { origin, batch }) => {
                    info!(origin, samples = batch.samples.len(), "audio batch");
                }
                Ok(ClientEvent::AudioOpus { origin, batch }) => {
                    info!(origin, packets = batch.packets.len(), "opus batch");
                }
                Ok(ClientEvent::ServerError(err)) => {
                    error!(code = %err.code, message = %err.message, "server error");
                }
                Ok(_) => {}
                Err(err) => return client_failure(err),
            }
        }
    }
}

/// Maps client failures onto the documented exit codes, with a short
/// human-readable cause.
fn client_failure(err: ClientError) -> ExitCode {
    match &err {
        ClientError::Handshake(handshake) => {
            error!(error = %handshake, "handshake failed");
            ExitCode::from(EXIT_CRYPTO)
        }
        ClientError::Crypto(_) | ClientError::EncryptionPolicy => {
            error!(error = %err, "crypto failure");
            ExitCode::from(EXIT_CRYPTO)
        }
        _ => {
            error!(error = %err, "connection failed");
            ExitCode::from(EXIT_NETWORK)
        }
    }
}

async fn run_discovery(
    bind_addrs: Vec<std::net::IpAddr>,
    port: u16,
    database: Option<PathBuf>,
    turn_secret: Option<String>,
) -> ExitCode {
    let registry = match Registry::open(RegistryConfig {
        turn_secret,
        persist_path: database,
        ..RegistryConfig::default()
    }) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(error = %err, "could not open registry database");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let service = DiscoveryService::new(registry, Timeouts::from_env());
    let cancel = service.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });

    let mut runners = Vec::new();
    for addr in bind_addrs {
        let listener = match tokio::net::TcpListener::bind((addr, port)).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, %addr, port, "could not bind discovery port");
                return ExitCode::from(EXIT_NETWORK);
            }
        };
        runners.push(tokio::spawn(service.clone().run(listener)));
    }
    for runner in runners {
        let _ = runner.await;
    }
    ExitCode::SUCCESS
}
