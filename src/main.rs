use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshsub::{GossipSub, GossipSubConfig, GossipSubEvent, Keypair, MemoryNetwork, PublishOptions};

/// Run a line of in-memory routers and push messages through it.
#[derive(Parser, Debug)]
#[command(name = "meshsub")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of routers, connected in a line.
    #[arg(short, long, default_value = "5")]
    nodes: usize,

    #[arg(short, long, default_value = "demo")]
    topic: String,

    /// Messages published by the first router.
    #[arg(short, long, default_value = "10")]
    messages: usize,

    #[arg(long, default_value = "200")]
    heartbeat_ms: u64,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        anyhow::bail!("need at least two nodes");
    }

    let config = GossipSubConfig {
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        ..Default::default()
    };

    let network = MemoryNetwork::new();
    let mut routers: Vec<GossipSub> = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let router = network
            .spawn_node(Keypair::generate(), config.clone())
            .await
            .context("failed to start router")?;
        info!(identity = %router.local_identity().short(), "router started");
        routers.push(router);
    }

    for pair in routers.windows(2) {
        network
            .connect(&pair[0].local_identity(), &pair[1].local_identity())
            .await?;
    }

    let mut receivers = Vec::with_capacity(routers.len() - 1);
    for router in &routers {
        router.subscribe(&args.topic).await?;
    }
    for router in routers.iter().skip(1) {
        receivers.push((router.local_identity(), router.subscribe_events()));
    }

    // Let subscriptions propagate and meshes form.
    time::sleep(Duration::from_millis(args.heartbeat_ms * 3)).await;

    let publisher = &routers[0];
    for i in 0..args.messages {
        let payload = format!("message {i}").into_bytes();
        match publisher.publish(&args.topic, payload, PublishOptions::default()).await {
            Ok(result) => info!(
                msg_id = %hex::encode(&result.id[..8]),
                recipients = result.recipients.len(),
                "published"
            ),
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }

    let expected = args.messages * receivers.len();
    let mut delivered = 0usize;
    let deadline = time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    while delivered < expected {
        let mut progressed = false;
        for (identity, rx) in receivers.iter_mut() {
            while let Ok(event) = rx.try_recv() {
                if let GossipSubEvent::Message { message, propagation_source, .. } = event {
                    delivered += 1;
                    progressed = true;
                    info!(
                        node = %identity.short(),
                        from = %propagation_source.short(),
                        data = %String::from_utf8_lossy(&message.data),
                        "delivered"
                    );
                }
            }
        }
        if progressed {
            continue;
        }
        // Graceful shutdown on Ctrl+C
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = &mut deadline => {
                warn!(delivered, expected, "timed out waiting for deliveries");
                break;
            }
            _ = time::sleep(Duration::from_millis(20)) => {}
        }
    }

    info!(delivered, expected, "done");
    for router in &routers {
        router.stop().await;
    }
    Ok(())
}
