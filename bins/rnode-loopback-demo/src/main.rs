use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rnode::{NodeConfig, RdmaNode, StopReport};
use rnode_logging::{init_logging, LogConfig};
use rnode_verbs::LoopbackFabric;

/// RDMA node loopback demo
///
/// Starts a listening node and a client-mode node on one in-process fabric,
/// has several threads acquire the same channel, then stops both nodes.
#[derive(Parser, Debug)]
#[command(name = "rnode-loopback-demo", version, about)]
struct Args {
    /// Node configuration file (TOML). Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the listening node binds to
    #[arg(long, default_value = "10.0.0.1")]
    server_host: String,

    /// Address the client node binds to
    #[arg(long, default_value = "10.0.0.2")]
    client_host: String,

    /// Threads acquiring the channel concurrently
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the default node configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&NodeConfig::default())?);
        return Ok(());
    }

    let _guard = init_logging(&LogConfig {
        level: args.log_level.clone(),
        ..LogConfig::default()
    })?;

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    let fabric = LoopbackFabric::default();
    let server = RdmaNode::builder(fabric.clone())
        .host(args.server_host.as_str())
        .config(config.clone())
        .build()
        .context("starting server node")?;
    let client = Arc::new(
        RdmaNode::builder(fabric.clone())
            .host(args.client_host.as_str())
            .client_mode(true)
            .config(config)
            .build()
            .context("starting client node")?,
    );
    tracing::info!(server = %server.local_addr(), client = %client.local_addr(), "nodes started");

    let target = server.local_addr();
    let handles: Vec<_> = (0..args.threads.max(1))
        .map(|i| {
            let client = Arc::clone(&client);
            thread::Builder::new()
                .name(format!("demo-acquire-{}", i))
                .spawn(move || client.get_rdma_channel(target, true))
        })
        .collect::<Result<_, _>>()?;

    let mut channels = Vec::with_capacity(handles.len());
    for handle in handles {
        let channel = handle
            .join()
            .map_err(|_| anyhow::anyhow!("acquire thread panicked"))??;
        channels.push(channel);
    }
    let shared = channels.iter().all(|c| Arc::ptr_eq(c, &channels[0]));
    println!(
        "{} threads acquired {} channel(s) to {}; connect calls on the fabric: {}",
        channels.len(),
        if shared { 1 } else { channels.len() },
        target,
        fabric.connect_attempts(target)
    );

    let passive = server
        .passive()
        .wait_for_host(&args.client_host, Duration::from_secs(5))
        .context("server never saw the client connection")?;
    println!(
        "server passive channels: {}, hosts: {:?}, {} is {:?}",
        server.passive().len(),
        server.passive().hosts(),
        args.client_host,
        passive.state()
    );

    let mut buf = client.buffer_manager().get(1024)?;
    buf.as_mut_slice()[..5].copy_from_slice(b"hello");
    println!(
        "registered buffer: addr={:#x} len={} lkey={} rkey={}",
        buf.addr(),
        buf.len(),
        buf.lkey(),
        buf.rkey()
    );
    client.buffer_manager().put(buf);

    drop(channels);
    report("client", &client.stop());
    report("server", &server.stop());
    println!(
        "live ids={} event channels={} pds={} regions={}",
        fabric.live_ids(),
        fabric.live_event_channels(),
        fabric.live_pds(),
        fabric.live_regions()
    );
    Ok(())
}

fn report(name: &str, report: &StopReport) {
    println!(
        "{} stopped: {} active, {} passive, {} failures, accept thread joined: {}, buffers released: {}, resources released: {}",
        name,
        report.active_stopped,
        report.passive_stopped,
        report.stop_failures,
        report.accept_thread_joined,
        report.buffers_released,
        report.resources_released
    );
}
