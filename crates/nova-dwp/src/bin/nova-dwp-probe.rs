use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nova_dwp::{
    ConnectionConfig, EventDetail, EventKind, Session, SuspendPolicy, TcpConfig,
};
use tracing_subscriber::EnvFilter;

/// Attach to a debuggee, print what it reports, and detach.
#[derive(Debug, Parser)]
#[command(name = "nova-dwp-probe", version, about)]
struct Cli {
    /// Debuggee address, e.g. `127.0.0.1:55555`.
    addr: String,

    /// Log filter; overrides `RUST_LOG`.
    #[arg(long)]
    log: Option<String>,

    /// Connect and handshake timeout in seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Subscribe to lifecycle events and print them until the debuggee goes
    /// away.
    #[arg(long)]
    events: bool,
}

const LIFECYCLE: [EventKind; 6] = [
    EventKind::VmDeath,
    EventKind::ThreadStart,
    EventKind::ThreadDeath,
    EventKind::AppDomainCreate,
    EventKind::AssemblyLoad,
    EventKind::UserLog,
];

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let timeout = Duration::from_secs(cli.timeout);
    let tcp = TcpConfig {
        connect_timeout: timeout,
        ..TcpConfig::default()
    };
    let config = ConnectionConfig {
        handshake_timeout: timeout,
        ..ConnectionConfig::default()
    };
    let session = Session::connect_tcp(cli.addr.as_str(), &tcp, config)
        .await
        .with_context(|| format!("failed to attach to {}", cli.addr))?;

    let conn = session.connection();
    if let Some(peer) = conn.peer_version() {
        println!("peer: {} ({})", peer.description, peer.version);
    }
    println!("negotiated: {}", conn.version());
    let root = session.root_domain();
    match root.friendly_name(conn).await {
        Ok(name) => println!("root domain: {} ({name})", root.id),
        Err(err) => println!("root domain: {} (name unavailable: {err})", root.id),
    }
    let threads = conn.all_threads().await.context("listing threads")?;
    println!("threads: {}", threads.len());

    if !cli.events {
        session.dispose().await;
        return Ok(());
    }

    for kind in LIFECYCLE {
        session
            .subscribe(kind, SuspendPolicy::None, Vec::new())
            .await
            .with_context(|| format!("subscribing to {kind:?}"))?;
    }
    // Let the debuggee run; it may have been started suspended.
    if let Err(err) = session.resume().await {
        tracing::debug!(target: "nova.dwp", error = %err, "initial resume failed");
    }

    loop {
        let set = match session.next_event().await {
            Ok(set) => set,
            Err(err) if err.is_connection_lost() => break,
            Err(err) => return Err(err.into()),
        };
        for record in &set.events {
            match &record.detail {
                EventDetail::UserLog {
                    level,
                    category,
                    message,
                } => println!("{:?} [{level}] {category}: {message}", record.kind),
                EventDetail::VmDeath { exit_code } => {
                    println!("{:?} exit_code={exit_code:?}", record.kind)
                }
                _ => match record.target_id() {
                    Some(id) => {
                        println!("{:?} thread={} target={id}", record.kind, record.thread_id)
                    }
                    None => println!("{:?} thread={}", record.kind, record.thread_id),
                },
            }
        }
        if set.is_disconnect() {
            break;
        }
    }
    Ok(())
}

fn init_logging(filter: Option<&str>) {
    let filter = filter
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
