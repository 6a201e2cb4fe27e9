// LanShare node daemon: discovery, peer links and file transfer, logging events until shutdown.

use std::sync::Arc;

use lanshare_node::{config, MemoryBlockList, MemoryHistory, Node, NodeEvent, VERSION};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let mut name = None;
    let mut port = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanshare-node {}", VERSION);
                return Ok(());
            }
            "--name" => name = args.next(),
            "--port" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--port needs a value"))?;
                port = Some(v.parse::<u16>()?);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let loaded = config::load();
    let mut cfg = loaded.config;
    if let Some(n) = name {
        cfg.name = n;
    }
    if let Some(p) = port {
        cfg.tcp_port = p;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Some(w) = loaded.warning {
        warn!("config: {w}, using defaults");
    }
    if let Some(src) = loaded.source {
        info!(path = %src.display(), "config loaded");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let blocklist = MemoryBlockList::new(cfg.blocked_users.clone());
        let (node, mut events) = Node::new(cfg, Arc::new(MemoryHistory::new()), Arc::new(blocklist));
        let addr = node.start().await?;
        info!(id = %node.id(), %addr, "lanshare-node {} running", VERSION);

        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                log_event(ev);
            }
        });

        shutdown_signal().await?;
        node.stop().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn log_event(ev: NodeEvent) {
    match ev {
        NodeEvent::NewMessage(m) => {
            info!(from = %m.sender, to = %m.recipient, private = m.is_private, "{}", m.content)
        }
        NodeEvent::PeerOnline { id, name } => info!(%id, %name, "online"),
        NodeEvent::PeerOffline { id, name } => info!(%id, %name, "offline"),
        NodeEvent::PeerRenamed { id, old, new } => info!(%id, %old, %new, "renamed"),
        NodeEvent::FileRequested(t) => {
            info!(file_id = %t.file_id, from = %t.peer_name, name = %t.file_name, size = t.file_size, "file offered")
        }
        NodeEvent::TransferUpdated(t) => {
            tracing::debug!(file_id = %t.file_id, status = ?t.status, progress = t.progress, "transfer")
        }
        NodeEvent::UpdateAvailable(u) => {
            info!(version = %u.version, from = %u.name, ip = %u.ip, web_port = u.web_port, "update available")
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
