use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use fidium::{Contact, Identifier, Node};

/// One bootstrap peer: trust weight, endpoint, identifier.
#[derive(Clone, Debug)]
struct BootstrapPeer {
    weight: f64,
    addr: SocketAddr,
    identifier: Identifier,
}

impl BootstrapPeer {
    fn contact(&self) -> Contact {
        if self.weight > 0.0 {
            Contact::trusted(self.identifier, self.addr, self.weight)
        } else {
            Contact::new(self.identifier, self.addr)
        }
    }
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (weight_part, peer_part) = s
            .split_once('@')
            .context("bootstrap peer must include a trust weight (format: WEIGHT@IP:PORT/IDENTIFIER)")?;
        let (addr_part, id_part) = peer_part
            .rsplit_once('/')
            .context("bootstrap peer must include an identifier (format: WEIGHT@IP:PORT/IDENTIFIER)")?;

        let weight: f64 = weight_part.parse().context("invalid trust weight")?;
        if !(0.0..=1.0).contains(&weight) {
            anyhow::bail!("trust weight must be within 0.0..=1.0");
        }
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let identifier =
            Identifier::from_hex(id_part).context("identifier must be 128 hex characters")?;

        Ok(BootstrapPeer {
            weight,
            addr,
            identifier,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "fidium")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the peer-to-peer socket on.
    #[arg(short, long, default_value = "0.0.0.0:12000")]
    bind: SocketAddr,

    /// Bootstrap peers, repeatable. Format: WEIGHT@IP:PORT/IDENTIFIER.
    #[arg(short = 'P', long = "peer", value_name = "PEER")]
    peers: Vec<BootstrapPeer>,

    /// Seconds between stats log lines.
    #[arg(short, long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(&args.bind.to_string()).await?;
    info!("Node identifier: {}", node.identifier());

    for peer in &args.peers {
        let contact = peer.contact();
        info!("Adding bootstrap peer {} (weight {})", contact, peer.weight);
        node.add_peer(contact.clone());

        match node.ping(&contact, Duration::from_secs(2)).await {
            Ok(Some(rtt)) => info!("Peer {} reachable ({} ms)", contact, rtt.as_millis()),
            Ok(None) => warn!("Peer {} did not answer the initial ping", contact),
            Err(e) => warn!(error = %e, "Initial ping to {} failed", contact),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = node.stats();
                info!(
                    contacts = stats.contacts,
                    owned_entries = stats.owned_entries,
                    cached_entries = stats.cached_entries,
                    "stats snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
