//! vrelay-node binary entry point

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vrelay_crypto::Keypair;
use vrelay_node::gossip::HttpTransport;
use vrelay_node::membership::{Roster, RosterMembership};
use vrelay_node::sink::ChannelSink;
use vrelay_node::{RelayDeps, RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = ServerConfig::load()?;
    config.validate()?;

    let keypair = match &config.signing_key_path {
        Some(path) => {
            let seed = std::fs::read_to_string(path)
                .with_context(|| format!("reading signing key {}", path.display()))?;
            Keypair::from_seed_hex(seed.trim()).context("parsing signing key")?
        }
        None => {
            warn!("No signing_key_path configured, using an ephemeral key");
            Keypair::generate()
        }
    };

    let roster = match &config.roster_path {
        Some(path) => Roster::from_toml_file(path)
            .with_context(|| format!("loading roster {}", path.display()))?,
        None => {
            warn!("No roster_path configured, starting with an empty roster");
            Roster::new()
        }
    };
    info!("Loaded roster with {} members", roster.len());
    let membership = Arc::new(RosterMembership::new(keypair.identity().clone(), roster));

    // Downstream pipeline lives elsewhere; log what would be handed to it.
    let (sink, mut queue) = ChannelSink::new(config.queue_capacity);
    tokio::spawn(async move {
        while let Some(submission) = queue.recv().await {
            info!(
                "Submission {} from {} ({} account {:?}, post {:?})",
                submission.message_id,
                submission.owner,
                submission.platform,
                submission.account_id.as_deref().or(submission.username.as_deref()),
                submission.post_id.as_deref(),
            );
        }
    });

    let deps = RelayDeps::new(
        Arc::new(keypair),
        membership.clone(),
        Arc::new(sink),
        Arc::new(HttpTransport::new()?),
    )
    .with_roster(membership);

    // Create and run server
    let server = RelayServer::new(config, deps)?;
    server.run().await?;

    Ok(())
}
