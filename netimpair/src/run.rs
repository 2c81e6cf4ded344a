use anyhow::Context;
use fastrand::Rng;
use impairment_pipeline::config::{self, InterfaceSpec};
use impairment_pipeline::pcap_exporter::PcapExporter;
use impairment_pipeline::{
    ConfigStore, Direction, FileSource, PerDirection, Port, ReloadController, StageKind, Tunnel,
    TunnelOptions,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capture::{Bridge, PacketSocket};
use crate::config::cli::RunOpt;
use crate::{report, signals};

pub async fn run(options: RunOpt) -> anyhow::Result<()> {
    println!("--- Params ---");
    let rng_seed = if options.non_deterministic {
        Rng::new().u64(..)
    } else {
        options.rng_seed
    };
    println!("* Seed: {rng_seed}");
    println!("* Config path: {}", options.config.display());

    let source = Arc::new(FileSource::new(&options.config));
    let snapshot = config::load(source.as_ref())
        .with_context(|| format!("invalid configuration in {}", options.config.display()))?;
    report::print_snapshot(&snapshot);

    let left_socket = bind("Left", &snapshot.left)?;
    let right_socket = bind("Right", &snapshot.right)?;

    let pcap = match &options.pcap_dir {
        Some(dir) => Some(pcap_exporters(dir)?),
        None => None,
    };

    let store = Arc::new(ConfigStore::new(snapshot));
    let (left_port, left_peer) = Port::pair(options.channel_capacity);
    let (right_port, right_peer) = Port::pair(options.channel_capacity);
    let tunnel = Tunnel::start(
        store.clone(),
        left_port,
        right_port,
        TunnelOptions {
            channel_capacity: options.channel_capacity,
            rng_seed,
            stage_order: StageKind::PIPELINE_ORDER.to_vec(),
            pcap: pcap.clone(),
        },
    );
    let bridges = [
        Bridge::spawn(left_socket, left_peer),
        Bridge::spawn(right_socket, right_peer),
    ];

    let (controller, reload) = ReloadController::new(source, store, tunnel.clone());
    let controller = tokio::spawn(controller.run());
    let hangups = signals::forward_hangups(reload)?;

    info!("tunnel running, send SIGHUP to reload the configuration");
    signals::interrupted().await?;
    info!("interrupted, draining the tunnel");

    hangups.abort();
    tunnel.shutdown().await;
    for bridge in bridges {
        bridge.close().await;
    }
    controller.abort();

    if let Some(pcap) = pcap {
        for direction in Direction::BOTH {
            let exporter = pcap.get(direction);
            if let Err(e) = exporter.flush() {
                warn!(%direction, "{e:#}");
            }
            info!(
                %direction,
                frames = exporter.total_tracked_frames(),
                "capture written"
            );
        }
    }

    report::print_stats(&tunnel.stats());
    Ok(())
}

fn bind(side: &str, spec: &InterfaceSpec) -> anyhow::Result<Arc<PacketSocket>> {
    anyhow::ensure!(
        !spec.device_name.is_empty(),
        "{side}.DeviceName must be set to run the tunnel"
    );

    let socket = PacketSocket::bind(&spec.device_name)
        .with_context(|| format!("failed to acquire the {side} interface"))?;
    Ok(Arc::new(socket))
}

fn pcap_exporters(dir: &Path) -> anyhow::Result<PerDirection<Arc<PcapExporter>>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let create = |direction: Direction| -> anyhow::Result<Arc<PcapExporter>> {
        let path = dir.join(format!("{direction}.pcapng"));
        Ok(Arc::new(PcapExporter::create(&path)?))
    };
    Ok(PerDirection::new(
        create(Direction::LeftToRight)?,
        create(Direction::RightToLeft)?,
    ))
}
