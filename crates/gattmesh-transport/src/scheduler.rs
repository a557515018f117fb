//! Per-link priority scheduling.
//!
//! One worker task owns every link queue. Producers and link callbacks talk
//! to it only through an unbounded command channel, so queue state needs no
//! locking and commands from all sources are handled in one place.
//!
//! # Drain turn
//!
//! ```text
//! rotation: [A, B, C]          pop A
//!   ┌───────────────────────────────────────────────────┐
//!   │ head of high queue?                               │
//!   │   yes: window full? ── yes ──▶ end turn           │
//!   │        no: issue, in_flight += 1                  │
//!   │   no:  head of low queue? issue (no completion)   │
//!   │ rejected ──▶ requeue at front, park, end turn     │
//!   │ yield, absorb pending commands, repeat            │
//!   └───────────────────────────────────────────────────┘
//! still sendable ──▶ push A to back of rotation
//! idle ──▶ discard A's queue
//! ```
//!
//! High-priority units are serviced to exhaustion (within the window) before
//! any low-priority unit. Within one link and class, units go out in FIFO
//! order; a failed unit returns to the front so it precedes newer ones.

use crate::config::SchedulerConfig;
use crate::error::{Result, TransportError};
use crate::link::LinkAddress;
use crate::progress::{TransferClaim, TransferEvent, TransferId, TransportEvent};
use crate::retry::{FailureKind, RetryConfig, RetryCoordinator, RetryDecision};
use crate::sender::{SendError, UnitSender};
use crate::unit::{Priority, SendUnit};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Commands consumed by the scheduler worker
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue {
        unit: SendUnit,
        at_front: bool,
    },
    WriteCompleted {
        address: LinkAddress,
        success: bool,
    },
    DropLink {
        address: LinkAddress,
    },
    Resume {
        address: LinkAddress,
        epoch: u64,
    },
    TrackTransfer {
        id: TransferId,
        total: usize,
        claim: TransferClaim,
    },
    CancelTransfer {
        id: TransferId,
    },
    Tick,
    LinkStats {
        address: LinkAddress,
        reply: oneshot::Sender<Option<LinkQueueStats>>,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown,
}

/// Snapshot of one link's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkQueueStats {
    /// Queued high-priority units
    pub high: usize,
    /// Queued low-priority units
    pub low: usize,
    /// Issued high-priority units awaiting completion
    pub in_flight: usize,
    /// Link is in the active rotation
    pub in_rotation: bool,
    /// Link is parked awaiting a retry delay
    pub parked: bool,
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Units accepted by the link layer
    pub issued: u64,
    /// Successful completions
    pub completed: u64,
    /// Failures that led to a requeue
    pub retried: u64,
    /// Units dropped (encode failure, retries exhausted, link lost)
    pub dropped: u64,
    /// In-flight units written off by the watchdog
    pub expired: u64,
    /// Links with a queue
    pub links: usize,
}

#[derive(Debug)]
struct InFlight {
    unit: SendUnit,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct LinkQueue {
    high: VecDeque<SendUnit>,
    low: VecDeque<SendUnit>,
    in_flight: VecDeque<InFlight>,
    in_rotation: bool,
    parked: bool,
    park_epoch: u64,
}

impl LinkQueue {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<SendUnit> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    fn has_pending(&self) -> bool {
        !self.high.is_empty() || !self.low.is_empty()
    }

    /// Something could be issued right now
    fn is_sendable(&self, window: usize) -> bool {
        if self.parked {
            return false;
        }
        if self.high.is_empty() {
            !self.low.is_empty()
        } else {
            self.in_flight.len() < window
        }
    }

    fn is_idle(&self) -> bool {
        !self.has_pending() && self.in_flight.is_empty() && !self.parked
    }

    fn stats(&self) -> LinkQueueStats {
        LinkQueueStats {
            high: self.high.len(),
            low: self.low.len(),
            in_flight: self.in_flight.len(),
            in_rotation: self.in_rotation,
            parked: self.parked,
        }
    }
}

#[derive(Debug)]
struct TransferCounter {
    done: usize,
    total: usize,
    // Frees the transfer id when the counter goes away
    _claim: TransferClaim,
}

/// Cloneable handle to the scheduler worker
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| TransportError::Shutdown)
    }

    /// Append a unit to its link's queue
    pub fn enqueue(&self, unit: SendUnit) -> Result<()> {
        self.send(Command::Enqueue {
            unit,
            at_front: false,
        })
    }

    /// Prepend a unit to its link's queue
    pub fn enqueue_front(&self, unit: SendUnit) -> Result<()> {
        self.send(Command::Enqueue {
            unit,
            at_front: true,
        })
    }

    /// Report a write completion from the link layer
    ///
    /// Never blocks; safe to call from platform callback threads.
    pub fn write_completed(&self, address: LinkAddress, success: bool) -> Result<()> {
        self.send(Command::WriteCompleted { address, success })
    }

    /// Discard all queued and in-flight units for a disconnected link
    pub fn drop_link(&self, address: LinkAddress) -> Result<()> {
        self.send(Command::DropLink { address })
    }

    pub(crate) fn track_transfer(
        &self,
        id: TransferId,
        total: usize,
        claim: TransferClaim,
    ) -> Result<()> {
        self.send(Command::TrackTransfer { id, total, claim })
    }

    /// Stop counting a transfer and report it cancelled
    pub(crate) fn cancel_transfer(&self, id: TransferId) -> Result<()> {
        self.send(Command::CancelTransfer { id })
    }

    /// Snapshot of one link's queue
    pub async fn link_stats(&self, address: LinkAddress) -> Result<Option<LinkQueueStats>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LinkStats { address, reply })?;
        rx.await
            .map_err(|_| TransportError::channel("link stats reply dropped"))
    }

    /// Scheduler-wide counters
    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await
            .map_err(|_| TransportError::channel("stats reply dropped"))
    }

    /// Stop the worker after the commands already queued
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

/// Spawns the scheduler worker
pub struct LinkScheduler;

impl LinkScheduler {
    /// Start the worker and its in-flight watchdog on the current runtime
    ///
    /// The worker exits on `shutdown` or once every handle is dropped.
    pub fn spawn<S: UnitSender>(
        config: SchedulerConfig,
        retry: RetryConfig,
        sender: Arc<S>,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = tx.downgrade();

        let watchdog_interval = config.watchdog_interval;
        let watchdog_tx = tx.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watchdog_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = watchdog_tx.upgrade() else {
                    break;
                };
                if tx.send(Command::Tick).is_err() {
                    break;
                }
            }
        });

        let worker = Worker {
            config,
            retry: RetryCoordinator::new(retry, weak),
            sender,
            events,
            rx,
            queues: HashMap::new(),
            rotation: VecDeque::new(),
            transfers: HashMap::new(),
            stats: SchedulerStats::default(),
            stopping: false,
        };

        tracing::info!(
            "Link scheduler started (window={}, turn_budget={})",
            worker.config.window,
            worker.config.turn_budget
        );

        let task = tokio::spawn(worker.run());
        (SchedulerHandle { tx }, task)
    }
}

struct Worker<S> {
    config: SchedulerConfig,
    retry: RetryCoordinator,
    sender: Arc<S>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    rx: mpsc::UnboundedReceiver<Command>,
    queues: HashMap<LinkAddress, LinkQueue>,
    rotation: VecDeque<LinkAddress>,
    transfers: HashMap<TransferId, TransferCounter>,
    stats: SchedulerStats,
    stopping: bool,
}

impl<S: UnitSender> Worker<S> {
    async fn run(mut self) {
        while !self.stopping {
            self.absorb_pending();
            if self.stopping {
                break;
            }

            match self.rotation.pop_front() {
                Some(address) => self.drain_turn(address).await,
                None => match self.rx.recv().await {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        tracing::info!(
            "Link scheduler stopped (issued={}, completed={}, retried={}, dropped={})",
            self.stats.issued,
            self.stats.completed,
            self.stats.retried,
            self.stats.dropped
        );
    }

    fn absorb_pending(&mut self) {
        while !self.stopping {
            match self.rx.try_recv() {
                Ok(command) => self.handle(command),
                Err(_) => break,
            }
        }
    }

    async fn drain_turn(&mut self, address: LinkAddress) {
        let window = self.config.window;
        let mut issued = 0usize;

        match self.queues.get_mut(&address) {
            Some(queue) => queue.in_rotation = false,
            None => return,
        }

        loop {
            if self.stopping || issued >= self.config.turn_budget {
                break;
            }

            let Some(queue) = self.queues.get_mut(&address) else {
                // Dropped while we were yielding
                return;
            };
            if queue.parked {
                break;
            }

            let next = match queue.high.front() {
                Some(_) if queue.in_flight.len() >= window => break,
                Some(_) => queue.high.pop_front(),
                None => queue.low.pop_front(),
            };
            let Some(mut unit) = next else {
                break;
            };

            let result = self.sender.send(&unit).await;

            match result {
                Ok(()) => {
                    issued += 1;
                    self.stats.issued += 1;
                    self.count_progress(&mut unit);
                    if unit.priority == Priority::High {
                        if let Some(queue) = self.queues.get_mut(&address) {
                            queue.in_flight.push_back(InFlight {
                                unit,
                                issued_at: Instant::now(),
                            });
                        }
                    }
                }
                Err(SendError::Encode(e)) => {
                    tracing::warn!("Dropping unencodable unit for {}: {}", address, e);
                    self.stats.dropped += 1;
                    self.count_progress(&mut unit);
                }
                Err(SendError::Rejected(e)) => {
                    tracing::debug!("Write to {} rejected: {}", address, e);
                    self.fail(unit, FailureKind::Sync);
                    break;
                }
            }

            // Let completion callbacks through before the next unit
            tokio::task::yield_now().await;
            self.absorb_pending();
        }

        if let Some(queue) = self.queues.get(&address) {
            if queue.in_rotation {
                return;
            }
            if queue.is_sendable(window) {
                self.activate(&address);
            } else if queue.is_idle() {
                self.queues.remove(&address);
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { unit, at_front } => {
                let address = unit.address.clone();
                let queue = self.queues.entry(address.clone()).or_default();
                let class = queue.queue_mut(unit.priority);
                if at_front {
                    class.push_front(unit);
                } else {
                    class.push_back(unit);
                }
                self.activate(&address);
            }
            Command::WriteCompleted { address, success } => {
                self.on_write_completed(address, success);
            }
            Command::DropLink { address } => self.drop_link(&address),
            Command::Resume { address, epoch } => {
                if let Some(queue) = self.queues.get_mut(&address) {
                    if queue.park_epoch == epoch && queue.parked {
                        queue.parked = false;
                        self.settle(&address);
                    }
                }
            }
            Command::TrackTransfer { id, total, claim } => {
                self.transfers.insert(
                    id,
                    TransferCounter {
                        done: 0,
                        total,
                        _claim: claim,
                    },
                );
            }
            Command::CancelTransfer { id } => {
                if self.transfers.remove(&id).is_some() {
                    self.emit(TransferEvent::Cancelled { id });
                }
            }
            Command::Tick => self.expire_in_flight(),
            Command::LinkStats { address, reply } => {
                let _ = reply.send(self.queues.get(&address).map(LinkQueue::stats));
            }
            Command::Stats { reply } => {
                let mut stats = self.stats;
                stats.links = self.queues.len();
                let _ = reply.send(stats);
            }
            Command::Shutdown => {
                self.stopping = true;
            }
        }
    }

    /// Abandon everything queued or in flight on a disconnected link
    ///
    /// Abandoned units still count toward their transfer so it can finish.
    fn drop_link(&mut self, address: &LinkAddress) {
        self.rotation.retain(|a| a != address);
        let Some(queue) = self.queues.remove(address) else {
            return;
        };

        let LinkQueue {
            high,
            low,
            in_flight,
            ..
        } = queue;
        let abandoned: Vec<SendUnit> = high
            .into_iter()
            .chain(low)
            .chain(in_flight.into_iter().map(|entry| entry.unit))
            .collect();
        if abandoned.is_empty() {
            return;
        }

        tracing::debug!(
            "Link {} dropped, abandoning {} units",
            address,
            abandoned.len()
        );
        self.stats.dropped += abandoned.len() as u64;
        for mut unit in abandoned {
            self.count_progress(&mut unit);
        }
    }

    fn on_write_completed(&mut self, address: LinkAddress, success: bool) {
        let Some(queue) = self.queues.get_mut(&address) else {
            return;
        };
        let Some(entry) = queue.in_flight.pop_front() else {
            tracing::trace!("Completion for {} with nothing in flight", address);
            return;
        };

        if success {
            self.stats.completed += 1;
            self.settle(&address);
        } else {
            tracing::debug!("Write to {} failed on completion", address);
            self.fail(entry.unit, FailureKind::Async);
        }
    }

    fn fail(&mut self, mut unit: SendUnit, kind: FailureKind) {
        unit.attempts = unit.attempts.saturating_add(1);
        let address = unit.address.clone();

        match self.retry.decide(unit.attempts, kind) {
            RetryDecision::GiveUp => {
                tracing::warn!(
                    "Dropping unit for {} after {} failed attempts",
                    address,
                    unit.attempts
                );
                self.stats.dropped += 1;
                self.count_progress(&mut unit);
                self.settle(&address);
            }
            RetryDecision::Retry { delay } => {
                let Some(queue) = self.queues.get_mut(&address) else {
                    // Link dropped meanwhile, nowhere to retry
                    self.stats.dropped += 1;
                    self.count_progress(&mut unit);
                    return;
                };
                self.stats.retried += 1;
                queue.queue_mut(unit.priority).push_front(unit);
                queue.parked = true;
                queue.park_epoch += 1;
                let epoch = queue.park_epoch;
                if queue.in_rotation {
                    queue.in_rotation = false;
                    self.rotation.retain(|a| a != &address);
                }
                self.retry.schedule_resume(address, epoch, delay);
            }
        }
    }

    /// Write off in-flight units whose completion never arrived
    fn expire_in_flight(&mut self) {
        let timeout = self.config.inflight_timeout;
        let now = Instant::now();
        let mut touched = Vec::new();

        for (address, queue) in self.queues.iter_mut() {
            let mut expired = 0;
            while queue
                .in_flight
                .front()
                .is_some_and(|f| now.saturating_duration_since(f.issued_at) >= timeout)
            {
                queue.in_flight.pop_front();
                self.sender.expired(address);
                expired += 1;
            }
            if expired > 0 {
                tracing::warn!(
                    "{} in-flight writes to {} timed out without completion",
                    expired,
                    address
                );
                self.stats.expired += expired;
                touched.push(address.clone());
            }
        }

        for address in touched {
            self.settle(&address);
        }
    }

    /// Re-enter rotation if sendable, discard the queue if idle
    fn settle(&mut self, address: &LinkAddress) {
        let Some(queue) = self.queues.get(address) else {
            return;
        };
        if queue.is_idle() && !queue.in_rotation {
            self.queues.remove(address);
        } else {
            self.activate(address);
        }
    }

    fn activate(&mut self, address: &LinkAddress) {
        let window = self.config.window;
        if let Some(queue) = self.queues.get_mut(address) {
            if !queue.in_rotation && queue.is_sendable(window) {
                queue.in_rotation = true;
                self.rotation.push_back(address.clone());
            }
        }
    }

    fn count_progress(&mut self, unit: &mut SendUnit) {
        if unit.counted {
            return;
        }
        unit.counted = true;
        let Some(id) = unit.transfer_id.clone() else {
            return;
        };
        let Some(counter) = self.transfers.get_mut(&id) else {
            return;
        };

        counter.done += 1;
        let (done, total) = (counter.done, counter.total);
        self.emit(TransferEvent::Progress {
            id: id.clone(),
            done,
            total,
        });
        if done >= total {
            self.transfers.remove(&id);
            self.emit(TransferEvent::Completed { id });
        }
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(TransportEvent::Transfer(event));
        }
    }
}
