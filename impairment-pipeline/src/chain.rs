//! Chain generations
//!
//! A generation is everything built for one configuration version: a chain of stage workers
//! per direction, connected by bounded channels, and one egress task per direction merging
//! the chain output with the replies synthesized by the opposite chain.

use fastrand::Rng;
use futures_util::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::{ConfigSnapshot, ConfigStore};
use crate::direction::{Direction, PerDirection};
use crate::frame::Frame;
use crate::modules::{Outcome, Released, Stage, StageContext, StageKind};
use crate::packet::FrameInfo;
use crate::pcap_exporter::PcapExporter;
use crate::stats::{StageCounters, StatsRegistry};

/// Synthesized replies a worker holds while the return path is blocked
const REPLY_BACKLOG: usize = 16;

enum Step {
    Continue,
    Received(Option<Frame>),
    OutputClosed,
}

/// Runs one stage of one direction
pub(crate) struct StageWorker {
    stage: Stage,
    direction: Direction,
    store: Arc<ConfigStore>,
    counters: Arc<StageCounters>,
    input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<Frame>,
    replies: mpsc::Sender<Frame>,
}

impl StageWorker {
    /// Moves frames from the input through the stage to the output
    ///
    /// Frames a stage queues itself stay in that queue until the output can take them, so a
    /// blocked output shows up as the stage's own backlog. Only frames the stage passes on
    /// directly wait in `ready`, and at most one of them at a time.
    pub(crate) async fn run(mut self) {
        let kind = self.stage.kind();
        let releases_replies = self.stage.releases_replies();

        let mut ready = VecDeque::new();
        let mut replies = VecDeque::new();
        let mut input_open = true;

        loop {
            let now = Instant::now();
            if releases_replies {
                self.collect_replies(now, &mut replies);
            }

            if !input_open && ready.is_empty() && replies.is_empty() && self.stage.is_drained() {
                break;
            }

            let next_release = self.stage.next_release();
            let forward_due = !releases_replies && next_release.is_some_and(|at| at <= now);
            let admitting = input_open && ready.is_empty() && replies.len() < REPLY_BACKLOG;
            let wake_at = next_release.filter(|&at| {
                if releases_replies {
                    replies.len() < REPLY_BACKLOG
                } else {
                    at > now
                }
            });

            let step = tokio::select! {
                biased;
                permit = self.output.reserve(), if !ready.is_empty() || forward_due => match permit {
                    Ok(permit) => {
                        if let Some(frame) = ready.pop_front() {
                            permit.send(frame);
                        } else if let Some(Released::Forward(frame)) = self.stage.pop_due(now) {
                            self.counters.passed.track_one(frame.len());
                            permit.send(frame);
                        }
                        Step::Continue
                    }
                    Err(_) => Step::OutputClosed,
                },
                permit = self.replies.reserve(), if !replies.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(frame) = replies.pop_front() {
                                permit.send(frame);
                            }
                        }
                        Err(_) => {
                            trace!(direction = %self.direction, stage = %kind, "worker: return path closed, discarding replies");
                            replies.clear();
                        }
                    }
                    Step::Continue
                }
                _ = time::sleep_until(wake_at.unwrap_or(now)), if wake_at.is_some() => Step::Continue,
                received = self.input.recv(), if admitting => Step::Received(received),
                else => Step::OutputClosed,
            };

            match step {
                Step::Continue => {}
                Step::Received(Some(frame)) => self.handle(frame, &mut ready, &mut replies).await,
                Step::Received(None) => input_open = false,
                Step::OutputClosed => {
                    debug!(direction = %self.direction, stage = %kind, "worker: output closed");
                    break;
                }
            }
        }

        trace!(direction = %self.direction, stage = %kind, "worker: exiting");
    }

    /// Moves due replies out of the stage's own queue
    fn collect_replies(&mut self, now: Instant, replies: &mut VecDeque<Frame>) {
        while replies.len() < REPLY_BACKLOG {
            let Some(Released::Reply(frame)) = self.stage.pop_due(now) else {
                break;
            };
            self.counters.replied.track_one(frame.len());
            replies.push_back(frame);
        }
    }

    async fn handle(
        &mut self,
        frame: Frame,
        ready: &mut VecDeque<Frame>,
        replies: &mut VecDeque<Frame>,
    ) {
        let size = frame.len();

        // The snapshot guard must not live across an await point
        let outcome = {
            let snapshot = self.store.load();
            if !self.stage.kind().is_enabled(&snapshot) || is_local_traffic(&snapshot, &frame) {
                Outcome::Pass(frame)
            } else {
                let mut cx = StageContext::new(
                    &snapshot,
                    self.direction,
                    Instant::now(),
                    replies,
                    &self.counters,
                );
                self.stage.process(frame, &mut cx)
            }
        };

        match outcome {
            Outcome::Pass(frame) => {
                self.counters.passed.track_one(frame.len());
                ready.push_back(frame);
            }
            Outcome::PassAt(frame, at) => {
                time::sleep_until(at).await;
                self.counters.passed.track_one(frame.len());
                ready.push_back(frame);
            }
            Outcome::Drop => self.counters.dropped.track_one(size),
            Outcome::Queued => {}
        }
    }
}

/// Frames to or from the tunnel host itself are never impaired
fn is_local_traffic(snapshot: &ConfigSnapshot, frame: &Frame) -> bool {
    snapshot.has_local_addresses()
        && FrameInfo::parse(frame.as_bytes()).is_some_and(|info| {
            snapshot.is_local_address(info.ip.source)
                || snapshot.is_local_address(info.ip.destination)
        })
}

/// Where the frames of one direction leave the tunnel
#[derive(Clone)]
pub(crate) struct EgressSink {
    pub(crate) outbound: mpsc::Sender<Frame>,
    pub(crate) pcap: Option<Arc<PcapExporter>>,
}

struct Egress {
    direction: Direction,
    output: mpsc::Receiver<Frame>,
    replies: mpsc::Receiver<Frame>,
    sink: EgressSink,
    stats: Arc<StatsRegistry>,
}

impl Egress {
    async fn run(mut self) {
        let mut output_open = true;
        let mut replies_open = true;

        while output_open || replies_open {
            let frame = tokio::select! {
                biased;
                frame = self.output.recv(), if output_open => {
                    if frame.is_none() {
                        output_open = false;
                    }
                    frame
                }
                frame = self.replies.recv(), if replies_open => {
                    if frame.is_none() {
                        replies_open = false;
                    }
                    frame
                }
            };

            if let Some(frame) = frame {
                self.emit(frame).await;
            }
        }

        trace!(direction = %self.direction, "egress: exiting");
    }

    async fn emit(&self, frame: Frame) {
        self.stats.egress.get(self.direction).track_one(frame.len());
        if let Some(pcap) = &self.sink.pcap {
            if let Err(e) = pcap.track_frame(&frame) {
                warn!(direction = %self.direction, "egress: {e:#}");
            }
        }

        if self.sink.outbound.send(frame).await.is_err() {
            trace!(direction = %self.direction, "egress: port closed, discarding frame");
        }
    }
}

/// The tasks of one configuration version
pub(crate) struct Generation {
    version: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Resolves once every task has exited, which happens after the chain heads are dropped
    /// and all frames already admitted have left the tunnel
    pub(crate) async fn drained(self) {
        let version = self.version;
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(version, "chain task panicked: {e}");
                }
            }
        }

        debug!(version, "generation drained");
    }
}

/// Builds chain generations against the shared store and counters
pub(crate) struct ChainBuilder {
    store: Arc<ConfigStore>,
    stats: Arc<StatsRegistry>,
    stage_order: Vec<StageKind>,
    channel_capacity: usize,
    rng: Rng,
}

impl ChainBuilder {
    pub(crate) fn new(
        store: Arc<ConfigStore>,
        stats: Arc<StatsRegistry>,
        stage_order: Vec<StageKind>,
        channel_capacity: usize,
        rng: Rng,
    ) -> Self {
        Self {
            store,
            stats,
            stage_order,
            channel_capacity: channel_capacity.max(1),
            rng,
        }
    }

    /// Spawns a generation and returns the heads of its two chains
    ///
    /// `sinks` is indexed by travel direction: frames going left to right leave through the
    /// right port.
    pub(crate) fn build(
        &mut self,
        version: u64,
        sinks: &PerDirection<EgressSink>,
    ) -> (PerDirection<mpsc::Sender<Frame>>, Generation) {
        let (replies_left_to_right, replies_left_to_right_rx) = mpsc::channel(self.channel_capacity);
        let (replies_right_to_left, replies_right_to_left_rx) = mpsc::channel(self.channel_capacity);
        let reply_tx = PerDirection::new(replies_left_to_right, replies_right_to_left);

        let mut tasks = Vec::new();
        let chains = PerDirection::from_fn(|direction| {
            // Replies travel back toward the sender of the frames this chain sees
            let replies = reply_tx.get(direction.reverse()).clone();
            self.chain(direction, replies, &mut tasks)
        });
        drop(reply_tx);

        let PerDirection {
            left_to_right: (left_to_right_head, left_to_right_output),
            right_to_left: (right_to_left_head, right_to_left_output),
        } = chains;
        let egresses = [
            (Direction::LeftToRight, left_to_right_output, replies_left_to_right_rx),
            (Direction::RightToLeft, right_to_left_output, replies_right_to_left_rx),
        ];
        for (direction, output, replies) in egresses {
            let egress = Egress {
                direction,
                output,
                replies,
                sink: sinks.get(direction).clone(),
                stats: self.stats.clone(),
            };
            tasks.push(tokio::spawn(egress.run()));
        }

        debug!(version, tasks = tasks.len(), "generation started");
        let heads = PerDirection::new(left_to_right_head, right_to_left_head);
        (heads, Generation { version, tasks })
    }

    fn chain(
        &mut self,
        direction: Direction,
        replies: mpsc::Sender<Frame>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (head, mut input) = mpsc::channel(self.channel_capacity);
        for &kind in &self.stage_order {
            let (output, next_input) = mpsc::channel(self.channel_capacity);
            let worker = StageWorker {
                stage: Stage::new(kind, self.rng.fork()),
                direction,
                store: self.store.clone(),
                counters: self.stats.stage(direction, kind),
                input,
                output,
                replies: replies.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
            input = next_input;
        }

        (head, input)
    }
}
