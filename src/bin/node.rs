//! AtlasRepo Node Binary
//!
//! Runs one repository node: peer server, 2PC participant, cluster backend
//! and the ownership claim for this node's partition.

use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use atlasrepo::backend::{Backend, ClusterBackend, Participant, TwoPhaseBackend, WalBackup};
use atlasrepo::network::PeerServer;
use atlasrepo::ownership::{self, FatalOwnershipLoss};
use atlasrepo::{Config, Entity, PeerConfig, Repository};

/// Exit code used when ownership can not be recovered
const EXIT_OWNERSHIP_LOST: i32 = 70;

/// AtlasRepo Node
#[derive(Parser, Debug)]
#[command(name = "atlasrepo-node")]
#[command(about = "Replicated in-memory object repository node")]
#[command(version)]
struct Args {
    /// Id of this node in the topology
    #[arg(short, long)]
    node_id: u32,

    /// Ordered topology: 1=host:port,2=host:port@/path/backup.wal
    #[arg(short, long)]
    peers: String,

    /// Listen address (defaults to this node's topology address)
    #[arg(short, long)]
    listen: Option<String>,

    /// Owners per entity
    #[arg(short, long, default_value = "2")]
    replication_factor: u32,

    /// Transaction timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    transaction_timeout_ms: u64,

    /// Prepared transaction expiry in milliseconds
    #[arg(long, default_value = "30000")]
    prepared_ttl_ms: u64,

    /// Maximum concurrent peer connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,
}

/// Demo entity served by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    id: String,
    version: u64,
    title: String,
    owner: String,
}

impl Entity for Document {
    type Key = String;
    const TYPE_NAME: &'static str = "Document";

    fn id(&self) -> String {
        self.id.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "title" => Some(self.title.clone()),
            "owner" => Some(self.owner.clone()),
            _ => None,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasrepo=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("AtlasRepo Node v{}", atlasrepo::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("Node error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Node stopped");
}

fn run(args: Args) -> atlasrepo::Result<()> {
    let peers = PeerConfig::parse_list(&args.peers)?;
    let listen = match args.listen {
        Some(listen) => listen,
        None => peers
            .iter()
            .find(|p| p.id == args.node_id)
            .map(|p| p.addr.clone())
            .unwrap_or_default(),
    };

    // Build config from args
    let config = Config::builder()
        .node_id(args.node_id)
        .peers(peers)
        .listen_addr(listen)
        .replication_factor(args.replication_factor)
        .transaction_timeout_ms(args.transaction_timeout_ms)
        .prepared_ttl_ms(args.prepared_ttl_ms)
        .max_connections(args.max_connections)
        .build();

    let repo = Arc::new(Repository::new(config.clone())?);
    repo.register::<Document>()?;
    repo.set_fatal_hook(Arc::new(|loss: &FatalOwnershipLoss| {
        tracing::error!(
            entity_type = loss.entity_type,
            query = %loss.query,
            attempts = loss.attempts,
            "ownership lost for good, exiting"
        );
        std::process::exit(EXIT_OWNERSHIP_LOST);
    }));

    // Step 1: Local backup store, if this node has one
    let backup: Option<Arc<dyn Backend>> = match config.me().and_then(|me| me.backup.clone()) {
        Some(path) => Some(Arc::new(WalBackup::open(path)?) as Arc<dyn Backend>),
        None => None,
    };

    // Step 2: Replication backend
    let mut two_phase = TwoPhaseBackend::new(ClusterBackend::connect_tcp(&config)?);
    if let Some(backup) = &backup {
        two_phase = two_phase.with_backup(Arc::clone(backup));
    }
    repo.add_backend(Arc::new(two_phase));

    // Step 3: Participant and peer server
    let mut participant = Participant::new(Arc::clone(&repo));
    if let Some(backup) = &backup {
        participant = participant.with_backup(Arc::clone(backup));
    }
    let participant = Arc::new(participant);
    participant.spawn_reaper()?;

    let server = PeerServer::bind(&config, participant)?;
    tracing::info!("Listening on {}", server.local_addr()?);

    // Step 4: Claim this node's partition once peers can reach us
    let claim = ownership::ownership_query(&config);
    tracing::info!("Claiming ownership of {}", claim);
    repo.claim_ownership(&claim);

    server.run()
}
