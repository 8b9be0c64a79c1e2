//! AtlasRepo CLI Client
//!
//! Command-line interface for inspecting a running node.

use std::time::Duration;

use clap::{Parser, Subcommand};

use atlasrepo::network::{PeerClient, TcpPeerClient};
use atlasrepo::protocol::{PeerRequest, PeerResponse};
use atlasrepo::Query;

/// AtlasRepo CLI
#[derive(Parser, Debug)]
#[command(name = "atlasrepo-cli")]
#[command(about = "CLI for AtlasRepo nodes")]
struct Args {
    /// Node address
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    server: String,

    /// Request timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping the node
    Ping,

    /// Records of an entity type known to the node
    Query {
        /// Entity type name
        entity_type: String,

        /// Match on a field, as name=value
        #[arg(short, long)]
        field: Option<String>,
    },
}

fn main() {
    let args = Args::parse();
    let client = TcpPeerClient::new(args.server.clone(), Duration::from_millis(args.timeout_ms));

    let request = match &args.command {
        Commands::Ping => PeerRequest::Ping,
        Commands::Query { entity_type, field } => {
            let query = match field.as_deref().map(|f| f.split_once('=')) {
                None => Query::All,
                Some(Some((name, value))) => Query::field_eq(name, value),
                Some(None) => {
                    eprintln!("--field must look like name=value");
                    std::process::exit(2);
                }
            };
            PeerRequest::Query {
                entity_type: entity_type.clone(),
                query,
            }
        }
    };

    match client.send(&request) {
        Ok(PeerResponse::Pong) => println!("PONG"),
        Ok(PeerResponse::QueryResult(result)) => {
            println!("owned: {}", result.owned);
            for record in &result.records {
                println!(
                    "{} {:?} v{} ({} bytes)",
                    record.type_name,
                    record.key,
                    record.version,
                    record.payload.len()
                );
            }
            println!("({} records)", result.records.len());
        }
        Ok(PeerResponse::Error(msg)) => {
            eprintln!("(error) {}", msg);
            std::process::exit(1);
        }
        Ok(other) => println!("{:?}", other),
        Err(e) => {
            eprintln!("(error) {}", e);
            std::process::exit(1);
        }
    }
}
