use fastrand::Rng;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainBuilder, EgressSink, Generation};
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::direction::{Direction, PerDirection};
use crate::frame::Frame;
use crate::modules::StageKind;
use crate::pcap_exporter::PcapExporter;
use crate::stats::{PipelineStats, StatsRegistry};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("the tunnel has been shut down")]
    ShutDown,
}

/// One side of the tunnel, as seen by the tunnel
///
/// Frames captured on the interface arrive through `inbound`; frames to inject are sent
/// through `outbound`.
pub struct Port {
    pub inbound: mpsc::Receiver<Frame>,
    pub outbound: mpsc::Sender<Frame>,
}

/// The interface side of a [`Port`]
pub struct PortPeer {
    pub to_tunnel: mpsc::Sender<Frame>,
    pub from_tunnel: mpsc::Receiver<Frame>,
}

impl Port {
    pub fn pair(capacity: usize) -> (Port, PortPeer) {
        let (to_tunnel, inbound) = mpsc::channel(capacity);
        let (outbound, from_tunnel) = mpsc::channel(capacity);
        (
            Port { inbound, outbound },
            PortPeer {
                to_tunnel,
                from_tunnel,
            },
        )
    }
}

pub struct TunnelOptions {
    pub channel_capacity: usize,
    pub rng_seed: u64,
    pub stage_order: Vec<StageKind>,
    /// Captures of the frames leaving the tunnel, per travel direction
    pub pcap: Option<PerDirection<Arc<PcapExporter>>>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            rng_seed: 42,
            stage_order: StageKind::PIPELINE_ORDER.to_vec(),
            pcap: None,
        }
    }
}

enum IngressCommand {
    Repoint {
        head: mpsc::Sender<Frame>,
        done: oneshot::Sender<()>,
    },
}

struct Wiring {
    builder: ChainBuilder,
    /// `None` once the tunnel has shut down
    sinks: Option<PerDirection<EgressSink>>,
}

/// Moves frames between the two ports through the impairment chains
///
/// Ingress tasks live as long as the tunnel. Chains are replaced as a whole on
/// [`Tunnel::rebuild`]: the ingress tasks are repointed to the new chain heads and the previous
/// generation drains in the background.
pub struct Tunnel {
    stats: Arc<StatsRegistry>,
    wiring: Mutex<Wiring>,
    ingress: PerDirection<mpsc::Sender<IngressCommand>>,
    ingress_tasks: Mutex<Vec<JoinHandle<()>>>,
    live: Mutex<Option<Generation>>,
    retiring: Mutex<Vec<JoinHandle<()>>>,
    rebuilding: tokio::sync::Mutex<()>,
    cancellation_token: CancellationToken,
}

impl Tunnel {
    /// Starts pumping frames with chains built for the store's current snapshot
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<ConfigStore>,
        left: Port,
        right: Port,
        options: TunnelOptions,
    ) -> Arc<Self> {
        let stats = Arc::new(StatsRegistry::default());
        let version = store.version();
        let mut builder = ChainBuilder::new(
            store,
            stats.clone(),
            options.stage_order,
            options.channel_capacity,
            Rng::with_seed(options.rng_seed),
        );

        let pcap = options.pcap;
        let capture = |direction| pcap.as_ref().map(|pcap| pcap.get(direction).clone());
        let sinks = PerDirection::new(
            EgressSink {
                outbound: right.outbound,
                pcap: capture(Direction::LeftToRight),
            },
            EgressSink {
                outbound: left.outbound,
                pcap: capture(Direction::RightToLeft),
            },
        );

        let (heads, generation) = builder.build(version, &sinks);
        let cancellation_token = CancellationToken::new();

        let spawn_ingress =
            |direction: Direction, port: mpsc::Receiver<Frame>, head: mpsc::Sender<Frame>| {
                let (commands, command_rx) = mpsc::channel(1);
                let ingress = Ingress {
                    direction,
                    port,
                    head,
                    commands: command_rx,
                    stats: stats.clone(),
                    cancellation_token: cancellation_token.clone(),
                };
                (commands, tokio::spawn(ingress.run()))
            };
        let (left_to_right, left_task) =
            spawn_ingress(Direction::LeftToRight, left.inbound, heads.left_to_right);
        let (right_to_left, right_task) =
            spawn_ingress(Direction::RightToLeft, right.inbound, heads.right_to_left);

        info!(version, "tunnel started");
        Arc::new(Self {
            stats,
            wiring: Mutex::new(Wiring {
                builder,
                sinks: Some(sinks),
            }),
            ingress: PerDirection::new(left_to_right, right_to_left),
            ingress_tasks: Mutex::new(vec![left_task, right_task]),
            live: Mutex::new(Some(generation)),
            retiring: Mutex::new(Vec::new()),
            rebuilding: tokio::sync::Mutex::new(()),
            cancellation_token,
        })
    }

    /// Replaces both chains with fresh ones built for `snapshot`
    ///
    /// Returns once ingress feeds the new chains. Frames admitted to the previous chains still
    /// leave the tunnel; no frame is admitted to them anymore.
    pub async fn rebuild(&self, snapshot: &ConfigSnapshot) -> Result<u64, TunnelError> {
        let _serialized = self.rebuilding.lock().await;
        let version = snapshot.version();

        let (heads, generation) = {
            let mut wiring = self.wiring.lock();
            let Wiring { builder, sinks } = &mut *wiring;
            let Some(sinks) = sinks.as_ref() else {
                return Err(TunnelError::ShutDown);
            };
            builder.build(version, sinks)
        };

        for (direction, head) in [
            (Direction::LeftToRight, heads.left_to_right),
            (Direction::RightToLeft, heads.right_to_left),
        ] {
            if let Err(e) = self.repoint(direction, head).await {
                self.retire(generation);
                return Err(e);
            }
        }

        let previous = self.live.lock().replace(generation);
        if let Some(previous) = previous {
            self.retire(previous);
        }

        info!(version, "tunnel switched to new chains");
        Ok(version)
    }

    async fn repoint(
        &self,
        direction: Direction,
        head: mpsc::Sender<Frame>,
    ) -> Result<(), TunnelError> {
        let (done, repointed) = oneshot::channel();
        self.ingress
            .get(direction)
            .send(IngressCommand::Repoint { head, done })
            .await
            .map_err(|_| TunnelError::ShutDown)?;
        repointed.await.map_err(|_| TunnelError::ShutDown)
    }

    fn retire(&self, generation: Generation) {
        debug!(version = generation.version(), "retiring generation");
        let mut retiring = self.retiring.lock();
        retiring.retain(|task| !task.is_finished());
        retiring.push(tokio::spawn(generation.drained()));
    }

    /// The configuration version the live chains were built for
    pub fn generation(&self) -> u64 {
        self.live.lock().as_ref().map_or(0, Generation::version)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Stops admitting frames and waits until every frame already admitted has left
    ///
    /// The ports' outbound channels are closed afterwards.
    pub async fn shutdown(&self) {
        let _serialized = self.rebuilding.lock().await;
        self.cancellation_token.cancel();

        let ingress = mem::take(&mut *self.ingress_tasks.lock());
        join_all(ingress).await;

        let live = self.live.lock().take();
        if let Some(live) = live {
            self.retire(live);
        }

        let retiring = mem::take(&mut *self.retiring.lock());
        join_all(retiring).await;

        self.wiring.lock().sinks = None;
        info!("tunnel shut down");
    }
}

enum IngressStep {
    Stop,
    Repoint(mpsc::Sender<Frame>, oneshot::Sender<()>),
    Received(Option<Frame>),
    Admitted,
    HeadClosed,
}

/// Feeds the frames of one port into the current chain head
struct Ingress {
    direction: Direction,
    port: mpsc::Receiver<Frame>,
    head: mpsc::Sender<Frame>,
    commands: mpsc::Receiver<IngressCommand>,
    stats: Arc<StatsRegistry>,
    cancellation_token: CancellationToken,
}

impl Ingress {
    async fn run(mut self) {
        // A frame read from the port but not yet committed to a chain
        let mut pending = None;
        let mut port_open = true;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => IngressStep::Stop,
                command = self.commands.recv() => match command {
                    Some(IngressCommand::Repoint { head, done }) => IngressStep::Repoint(head, done),
                    None => IngressStep::Stop,
                },
                permit = self.head.reserve(), if pending.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(frame) = pending.take() {
                            permit.send(frame);
                        }
                        IngressStep::Admitted
                    }
                    Err(_) => IngressStep::HeadClosed,
                },
                frame = self.port.recv(), if port_open && pending.is_none() => IngressStep::Received(frame),
            };

            match step {
                IngressStep::Stop => break,
                IngressStep::Repoint(head, done) => {
                    // Dropping the previous head lets the old chain drain
                    self.head = head;
                    done.send(()).ok();
                }
                IngressStep::Received(Some(frame)) => {
                    self.stats.ingress.get(self.direction).track_one(frame.len());
                    pending = Some(frame);
                }
                IngressStep::Received(None) => {
                    debug!(direction = %self.direction, "ingress: port closed");
                    port_open = false;
                }
                IngressStep::Admitted => {}
                IngressStep::HeadClosed => {
                    warn!(direction = %self.direction, "ingress: chain head closed, discarding frame");
                    pending = None;
                }
            }
        }

        debug!(direction = %self.direction, "ingress: stopped");
    }
}
