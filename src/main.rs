#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dispersy node entrypoint (systemd-friendly).
//! Boots the UDP endpoint and a community, then runs until a signal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dispersy::config::NodeConfig;
use dispersy::core::community::Community;
use dispersy::core::identity::LocalIdentity;
use dispersy::core::member::MemberDirectory;
use dispersy::monitoring::metrics::Metrics;
use dispersy::networking::endpoint::{spawn_udp_endpoint, Endpoint};
use dispersy::networking::peer_cache;
use dispersy::node::Node;
use dispersy::store::db::Database;
use tracing::{info, warn};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> Result<NodeConfig> {
    let path = PathBuf::from(env("DISPERSY_CONFIG", "./dispersy.toml"));
    if path.exists() {
        return NodeConfig::load(&path).context("load config");
    }
    // Env-only fallback keeps containers config-file free.
    let raw = format!(
        "[node]\nname = \"{}\"\ndata_dir = \"{}\"\n[endpoint]\nlisten_addr = \"{}\"\n",
        env("DISPERSY_NODE_NAME", "dispersy"),
        env("DISPERSY_DATA_DIR", "./data"),
        env("DISPERSY_LISTEN_ADDR", "0.0.0.0:6421"),
    );
    NodeConfig::parse(&raw).context("parse fallback config")
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let cfg = load_config()?;
    let data_dir = PathBuf::from(&cfg.node.data_dir);
    std::fs::create_dir_all(&data_dir).context("create data dir")?;

    let listen = cfg
        .endpoint
        .listen_addr
        .parse()
        .context("parse listen_addr")?;
    let (endpoint, inbound, endpoint_task) =
        spawn_udp_endpoint(listen).await.context("bind endpoint")?;

    let metrics = Arc::new(Metrics::new().context("metrics init")?);
    let db = Arc::new(Database::open(&data_dir.join("dispersy.db")).context("open store")?);
    let directory = Arc::new(MemberDirectory::new(db.clone()));

    let identity = Arc::new(
        LocalIdentity::load_or_create(&data_dir.join("member.key")).context("load identity")?,
    );
    // Without an explicit master key this node anchors its own community.
    let master_key = match env("DISPERSY_MASTER_KEY", "") {
        s if s.is_empty() => identity.public_key().clone(),
        s => dispersy::core::types::PublicKey(hex::decode(s.trim()).context("parse master key")?),
    };

    let community = Community::new(
        master_key,
        identity,
        db,
        directory,
        endpoint.clone(),
        metrics,
        cfg.core.to_core_config(),
    )
    .map_err(|e| anyhow::anyhow!("community init: {e}"))?;

    let known_peers = peer_cache::load(Path::new(&cfg.node.data_dir));
    if !known_peers.is_empty() {
        info!(peers = known_peers.len(), "loaded peer cache");
    }

    let mut node = Node::new(inbound);
    node.add_community(community);
    let handle = node.spawn();

    info!(name = %cfg.node.name, addr = %endpoint.local_address(), "dispersy node started");

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("signal listener failed; exiting");
    }
    handle.shutdown().await;
    endpoint_task.abort();
    Ok(())
}
