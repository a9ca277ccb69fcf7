//! shieldbox-vault - emergency access host for sealed documents
//!
//! holds ciphertext, the guardian directory and the audit log. never sees
//! an owner password or a vault root key.
//!
//! usage:
//!   shieldbox-vault --port 4200 --directory guardians.json
//!   shieldbox-vault --port 4200 --config shieldbox.json --data-dir /var/lib/shieldbox
//!
//! data stored in ~/.shieldbox-vault/

mod api;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ed25519_dalek::SigningKey;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use shieldbox::memory::{DirectorySnapshot, MemoryDirectory};
use shieldbox::{AuditLog, EmergencyCoordinator, Shield, ShieldboxConfig, SystemClock};
use tracing::{error, info, warn};

use crate::api::{AppState, LogDelivery};
use crate::store::SledStore;

/// shieldbox-vault - emergency access host for sealed documents
#[derive(Parser)]
#[command(name = "shieldbox-vault")]
#[command(about = "shieldbox vault - emergency access host for sealed documents")]
#[command(version)]
struct Args {
    /// port to listen on
    #[arg(short, long, default_value = "4200")]
    port: u16,

    /// data directory (default: ~/.shieldbox-vault)
    #[arg(short, long)]
    data_dir: Option<String>,

    /// bind address (default: 0.0.0.0)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// metrics port (prometheus endpoint, default: api_port + 1000)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// json config file, defaults apply when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// json file with owners and guardians
    #[arg(long)]
    directory: Option<String>,

    /// seconds between expiry sweeps
    #[arg(long, default_value = "60")]
    sweep_interval: u64,
}

fn load_config(path: Option<&str>) -> ShieldboxConfig {
    let Some(path) = path else {
        return ShieldboxConfig::default();
    };
    let json = std::fs::read_to_string(path).expect("failed to read config");
    match ShieldboxConfig::from_json(&json) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid config {}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn load_directory(path: Option<&str>) -> MemoryDirectory {
    let Some(path) = path else {
        warn!("no --directory given, every activation will fail with user_not_found");
        return MemoryDirectory::new();
    };
    let json = std::fs::read_to_string(path).expect("failed to read directory");
    let snapshot: DirectorySnapshot = match serde_json::from_str(&json) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("invalid directory {}: {}", path, e);
            std::process::exit(1);
        }
    };
    info!(
        "  directory: {} owners, {} guardians",
        snapshot.owners.len(),
        snapshot.guardians.len()
    );
    MemoryDirectory::from_snapshot(snapshot).expect("failed to load directory")
}

fn load_signing_key(data_dir: &str) -> SigningKey {
    let key_path = format!("{}/node.key", data_dir);
    if std::path::Path::new(&key_path).exists() {
        let key_bytes = std::fs::read(&key_path).expect("failed to read key");
        let key_arr: [u8; 32] = key_bytes.try_into().expect("invalid key length");
        SigningKey::from_bytes(&key_arr)
    } else {
        let key = SigningKey::generate(&mut rand::thread_rng());
        std::fs::write(&key_path, key.to_bytes()).expect("failed to write key");
        key
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shieldbox=info".parse().unwrap())
                .add_directive("shieldbox_vault=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    // setup prometheus metrics exporter
    let metrics_port = args.metrics_port.unwrap_or(args.port + 1000);
    let metrics_addr: std::net::SocketAddr = format!("{}:{}", args.bind, metrics_port)
        .parse()
        .expect("invalid metrics address");

    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install prometheus metrics exporter");

    let data_dir = args.data_dir.clone().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        format!("{}/.shieldbox-vault", home)
    });
    std::fs::create_dir_all(&data_dir).expect("failed to create data dir");

    let store = Arc::new(SledStore::open(&format!("{}/db", data_dir)).expect("failed to open database"));
    let (next_sequence, last_hash) = match store.audit_head() {
        Ok(head) => head,
        Err(e) => {
            error!("audit log failed verification: {}", e);
            error!("refusing to start on a broken chain");
            std::process::exit(1);
        }
    };

    let signing_key = load_signing_key(&data_dir);
    let pubkey = hex::encode(signing_key.verifying_key().to_bytes());

    let clock = Arc::new(SystemClock);
    let audit = Arc::new(
        AuditLog::resume(store.clone(), clock.clone(), next_sequence, last_hash).with_signer(signing_key),
    );
    let directory = Arc::new(load_directory(args.directory.as_deref()));

    let coordinator = Arc::new(EmergencyCoordinator::new(
        directory,
        store.clone(),
        audit.clone(),
        clock.clone(),
        config.emergency,
    ));
    let shield = Shield::new(
        coordinator.clone(),
        store.clone(),
        store.clone(),
        Arc::new(LogDelivery),
        clock,
        config.download,
    );

    info!("shieldbox-vault v{}", env!("CARGO_PKG_VERSION"));
    info!("  pubkey: {}", pubkey);
    info!("  data: {}", data_dir);
    info!("  audit entries: {}", next_sequence);
    info!("  bind: {}:{}", args.bind, args.port);
    info!("  metrics: {}:{}", args.bind, metrics_port);

    gauge!("shield_documents_current").set(store.document_count() as f64);
    gauge!("shield_audit_entries_current").set(store.audit_len() as f64);

    // expire activations whose tokens ran out
    let sweeper = coordinator.clone();
    let interval = Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sweeper.sweep_expired() {
                Ok(0) => {}
                Ok(n) => info!("expired {} activations", n),
                Err(e) => warn!("expiry sweep failed: {}", e),
            }
        }
    });

    let state = Arc::new(AppState {
        shield,
        store: store.clone(),
        audit,
        pubkey,
    });
    let app = api::router(state);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    info!("listening on {}", addr);

    axum::serve(listener, app).await.unwrap();
    store.flush().ok();
}
