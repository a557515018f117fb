//! Transport facade.
//!
//! [`MeshTransport`] owns one scheduler worker, the flow-control gate, the
//! fragment codec and the reassembly sweeper. Application code submits
//! messages through [`send`](MeshTransport::send) and
//! [`relay`](MeshTransport::relay); the link layer feeds inbound bytes,
//! write completions and disconnects back through the `on_*` methods.
//! Everything the caller hears about comes out of the event receiver
//! returned by [`start`](MeshTransport::start).

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::flow_control::FlowControlGate;
use crate::link::{ConnectionRegistry, Link, LinkAddress};
use crate::progress::{
    ActiveTransfers, TransferEvent, TransferHandle, TransferId, TransportEvent,
};
use crate::resolver::{Target, TargetResolver};
use crate::scheduler::{LinkScheduler, SchedulerHandle};
use crate::sender::GattSender;
use crate::unit::SendUnit;
use gattmesh_core::{Error as CoreError, FragmentCodec, Message, ReassemblyStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Mesh packet transport over GATT links
pub struct MeshTransport {
    config: TransportConfig,
    codec: Arc<FragmentCodec>,
    resolver: TargetResolver,
    gate: Arc<FlowControlGate>,
    scheduler: SchedulerHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    active: Arc<ActiveTransfers>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sweeper: JoinHandle<()>,
}

impl MeshTransport {
    /// Validate `config` and start the engine on the current tokio runtime
    ///
    /// Returns the transport and the receiver for inbound messages and
    /// transfer progress.
    pub fn start<L: Link>(
        config: TransportConfig,
        link: Arc<L>,
        registry: Arc<dyn ConnectionRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(FlowControlGate::new(config.flow_control.permits));
        let sender = Arc::new(GattSender::new(
            link,
            gate.clone(),
            config.flow_control.clone(),
        ));
        let (scheduler, worker) = LinkScheduler::spawn(
            config.scheduler.clone(),
            config.retry.clone(),
            sender,
            Some(events.clone()),
        );

        let codec = Arc::new(FragmentCodec::new(
            config.fragment.clone(),
            ReassemblyStore::new(config.reassembly.clone()),
        ));
        let sweeper = spawn_sweeper(codec.clone(), config.reassembly.sweep_interval);

        tracing::info!(
            "Mesh transport started (threshold={}, max_chunk={}, permits={})",
            config.fragment.threshold,
            config.fragment.max_chunk,
            config.flow_control.permits
        );

        let transport = Self {
            config,
            codec,
            resolver: TargetResolver::new(registry),
            gate,
            scheduler,
            events,
            active: Arc::new(ActiveTransfers::default()),
            worker: Mutex::new(Some(worker)),
            sweeper,
        };
        Ok((transport, events_rx))
    }

    /// Send a message to its recipient, or to every reachable peer
    ///
    /// Directed messages take the single best path to the recipient and fail
    /// with [`TransportError::NoRoute`] when there is none. Broadcasts go to
    /// one path per peer, skipping the message's own sender.
    ///
    /// A caller-supplied `transfer_id` must not belong to a transfer that is
    /// still running; such a send fails with
    /// [`TransportError::TransferActive`].
    pub fn send(
        &self,
        message: Message,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferHandle> {
        let targets = match message.recipient() {
            Some(recipient) if !recipient.is_broadcast() => {
                let target = self
                    .resolver
                    .resolve_one(recipient)
                    .ok_or(TransportError::NoRoute(recipient))?;
                vec![target]
            }
            _ => self
                .resolver
                .resolve_broadcast(None, Some(message.sender())),
        };
        self.dispatch(message, targets, transfer_id)
    }

    /// Forward a received message to every peer except where it came from
    ///
    /// TTL is left untouched; decrementing it is the caller's job.
    pub fn relay(&self, message: Message, arrived_from: &LinkAddress) -> Result<TransferHandle> {
        let targets = self
            .resolver
            .resolve_broadcast(Some(arrived_from), Some(message.sender()));
        self.dispatch(message, targets, None)
    }

    fn dispatch(
        &self,
        message: Message,
        targets: Vec<Target>,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferHandle> {
        let id = transfer_id.unwrap_or_else(TransferId::random);
        let claim = self
            .active
            .claim(&id)
            .ok_or_else(|| TransportError::TransferActive(id.clone()))?;
        let cancelled = claim.cancel_flag();

        let units: Vec<Arc<Message>> = self
            .codec
            .split(&message)?
            .into_iter()
            .map(Arc::new)
            .collect();
        let total = units.len() * targets.len();
        let handle = TransferHandle::new(id.clone(), cancelled.clone());

        tracing::debug!(
            "Transfer {}: {:?} message, {} units x {} targets",
            id,
            message.msg_type(),
            units.len(),
            targets.len()
        );

        self.emit(TransferEvent::Started {
            id: id.clone(),
            total,
        });
        if total == 0 {
            drop(claim);
            self.emit(TransferEvent::Completed { id });
            return Ok(handle);
        }
        self.scheduler.track_transfer(id.clone(), total, claim)?;

        if units.len() == 1 {
            for target in &targets {
                self.scheduler.enqueue(
                    SendUnit::new(
                        target.address.clone(),
                        target.kind.priority(),
                        units[0].clone(),
                    )
                    .with_transfer(id.clone()),
                )?;
            }
            return Ok(handle);
        }

        tokio::spawn(submit_fragments(Submission {
            id,
            units,
            targets,
            cancelled,
            scheduler: self.scheduler.clone(),
            delay: self.config.fragment.inter_fragment_delay,
        }));

        Ok(handle)
    }

    /// Stop submitting the remaining fragments of a transfer
    ///
    /// Returns false if the transfer is unknown or already finished. Units
    /// already handed to the scheduler are still sent.
    pub fn cancel_transfer(&self, id: &TransferId) -> bool {
        self.active.cancel(id)
    }

    /// Whether a transfer has yet to report `Completed` or `Cancelled`
    pub fn is_transfer_active(&self, id: &TransferId) -> bool {
        self.active.is_active(id)
    }

    /// Feed bytes received on `from` into the engine
    pub fn on_inbound(&self, from: &LinkAddress, bytes: &[u8]) {
        match self.codec.receive(bytes) {
            Ok(Some(message)) => self.deliver(message, from),
            Ok(None) => {}
            Err(CoreError::Decode(e)) => {
                tracing::warn!("Dropping undecodable packet from {}: {}", from, e)
            }
            Err(e) => tracing::debug!("Dropping fragment from {}: {}", from, e),
        }
    }

    fn deliver(&self, message: Message, from: &LinkAddress) {
        tracing::trace!(
            "Received {:?} from {} ({} bytes)",
            message.msg_type(),
            from,
            message.payload().len()
        );
        let _ = self.events.send(TransportEvent::MessageReceived {
            message,
            from: from.clone(),
        });
    }

    /// Completion callback for a client write
    pub fn on_write_completed(&self, address: &LinkAddress, success: bool) {
        self.gate.release(address);
        if self
            .scheduler
            .write_completed(address.clone(), success)
            .is_err()
        {
            tracing::trace!("Completion for {} after shutdown", address);
        }
    }

    /// A link disconnected; abandon its queue and permits
    pub fn on_link_lost(&self, address: &LinkAddress) {
        tracing::debug!("Link lost: {}", address);
        self.gate.drop_link(address);
        let _ = self.scheduler.drop_link(address.clone());
    }

    /// Engine configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Scheduler handle, for inspection
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Fragment codec and reassembly store
    pub fn codec(&self) -> &FragmentCodec {
        &self.codec
    }

    /// Flow-control gate
    pub fn gate(&self) -> &FlowControlGate {
        &self.gate
    }

    /// Target resolver
    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    /// Stop the scheduler worker and the reassembly sweeper
    ///
    /// Commands queued before this call are still processed.
    pub async fn shutdown(&self) {
        self.sweeper.abort();
        let _ = self.scheduler.shutdown();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    tracing::error!("Scheduler worker panicked: {}", e);
                }
            }
        }
        tracing::info!("Mesh transport stopped");
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(TransportEvent::Transfer(event));
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn spawn_sweeper(codec: Arc<FragmentCodec>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = codec.sweep(Instant::now());
            if evicted > 0 {
                tracing::debug!("Reassembly sweep evicted {} stale sets", evicted);
            }
        }
    })
}

struct Submission {
    id: TransferId,
    units: Vec<Arc<Message>>,
    targets: Vec<Target>,
    cancelled: Arc<AtomicBool>,
    scheduler: SchedulerHandle,
    delay: std::time::Duration,
}

/// Feed a fragmented transfer to the scheduler, fragment-major across targets
async fn submit_fragments(job: Submission) {
    let last = job.units.len().saturating_sub(1);

    for (index, unit) in job.units.iter().enumerate() {
        for target in &job.targets {
            if job.cancelled.load(Ordering::Acquire) {
                tracing::debug!("Transfer {} cancelled at fragment {}", job.id, index);
                let _ = job.scheduler.cancel_transfer(job.id.clone());
                return;
            }

            let send_unit = SendUnit::new(
                target.address.clone(),
                target.kind.priority(),
                unit.clone(),
            )
            .with_transfer(job.id.clone());
            if job.scheduler.enqueue(send_unit).is_err() {
                tracing::debug!("Scheduler gone, abandoning transfer {}", job.id);
                return;
            }
        }

        if index < last {
            if job.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(job.delay).await;
            }
        }
    }
}
