//! Dispatch router task
//!
//! Owns the ROUTER socket workers connect to and the registry built from
//! their registration announcements. Callers talk to it through a
//! [`DispatchHandle`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::WorkerRegistry;
use crate::config::{parse_addr, RouterSettings};
use crate::error::{Error, Result};
use crate::protocol::{is_registration, ControlMessage, Multipart, RequestEnvelope};
use crate::transport::RouterSocket;
use crate::types::{Identity, WorkerIdentity};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Dispatch router configuration
#[derive(Debug, Clone)]
pub struct DispatchRouterConfig {
    /// Address workers connect to
    pub bind_addr: SocketAddr,

    /// How long a dispatch on an empty registry waits for a worker
    pub registration_wait: Duration,

    /// Status tick
    pub poll_interval: Duration,

    /// Pending commands before callers wait
    pub command_queue: usize,
}

impl Default for DispatchRouterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5560)),
            registration_wait: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            command_queue: 256,
        }
    }
}

impl DispatchRouterConfig {
    pub fn from_settings(settings: &RouterSettings) -> Result<Self> {
        Ok(Self {
            bind_addr: parse_addr("router.bind_addr", &settings.bind_addr)?,
            registration_wait: Duration::from_millis(settings.registration_wait_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            ..Self::default()
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

/// Where a dispatch went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub worker: WorkerIdentity,
    /// Zero-based position of this dispatch in the router's history
    pub dispatch_index: u64,
}

/// Router counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub workers: usize,
    pub dispatched: u64,
    pub unreachable: u64,
    pub waiting: usize,
    pub broadcasts: u64,
}

enum RouterCommand {
    Dispatch {
        frames: Multipart,
        reply: oneshot::Sender<Result<DispatchReceipt>>,
    },
    Broadcast {
        frames: Multipart,
        reply: oneshot::Sender<usize>,
    },
    Workers(oneshot::Sender<Vec<WorkerIdentity>>),
    WaitForWorkers {
        count: usize,
        reply: oneshot::Sender<usize>,
    },
    Stats(oneshot::Sender<DispatchStats>),
    Shutdown {
        stop_workers: bool,
        reply: oneshot::Sender<usize>,
    },
}

/// Dispatch parked until a worker registers
struct WaitingDispatch {
    frames: Multipart,
    reply: oneshot::Sender<Result<DispatchReceipt>>,
    queued_at: Instant,
    deadline: Instant,
}

// ─────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────

/// Cloneable handle to a running dispatch router
#[derive(Clone)]
pub struct DispatchHandle {
    command_tx: mpsc::Sender<RouterCommand>,
    local_addr: SocketAddr,
}

impl DispatchHandle {
    /// Route a request to the next worker
    ///
    /// Waits for a first registration if the registry is empty and fails
    /// with `RegistryEmpty` once the configured wait has passed.
    pub async fn dispatch(&self, request: &RequestEnvelope) -> Result<DispatchReceipt> {
        self.dispatch_frames(request.to_frames()?).await
    }

    /// Route raw frames to the next worker
    pub async fn dispatch_frames(&self, frames: Multipart) -> Result<DispatchReceipt> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::Dispatch { frames, reply }).await?;
        rx.await.map_err(|_| Error::channel_closed("dispatch router"))?
    }

    /// Send a control message to every registered worker
    ///
    /// Returns how many workers it was delivered to.
    pub async fn broadcast(&self, control: ControlMessage) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::Broadcast {
            frames: control.to_frames(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::channel_closed("dispatch router"))
    }

    /// Registered workers in registration order
    pub async fn workers(&self) -> Result<Vec<WorkerIdentity>> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::Workers(reply)).await?;
        rx.await.map_err(|_| Error::channel_closed("dispatch router"))
    }

    /// Wait until at least `count` workers have registered
    pub async fn wait_for_workers(&self, count: usize, timeout: Duration) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::WaitForWorkers { count, reply })
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(registered)) => Ok(registered),
            Ok(Err(_)) => Err(Error::channel_closed("dispatch router")),
            Err(_) => Err(Error::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn stats(&self) -> Result<DispatchStats> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::Stats(reply)).await?;
        rx.await.map_err(|_| Error::channel_closed("dispatch router"))
    }

    /// Stop the router, optionally sending `STOP` to every worker first
    ///
    /// Returns how many workers were sent `STOP`.
    pub async fn shutdown(&self, stop_workers: bool) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send_command(RouterCommand::Shutdown {
            stop_workers,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::channel_closed("dispatch router"))
    }

    /// Address workers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_command(&self, command: RouterCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::channel_closed("dispatch router"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Router Task
// ─────────────────────────────────────────────────────────────────

/// Round-robin dispatcher over registered workers
pub struct DispatchRouter {
    socket: RouterSocket,
    registry: WorkerRegistry,
    waiting: VecDeque<WaitingDispatch>,
    worker_waiters: Vec<(usize, oneshot::Sender<usize>)>,
    registration_wait: Duration,
    poll_interval: Duration,
    unreachable: u64,
    broadcasts: u64,
}

impl DispatchRouter {
    /// Bind the router socket and start the router task
    pub async fn start(config: DispatchRouterConfig) -> Result<(DispatchHandle, JoinHandle<()>)> {
        let socket = RouterSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr();
        let (command_tx, command_rx) = mpsc::channel(config.command_queue);

        let router = Self {
            socket,
            registry: WorkerRegistry::new(),
            waiting: VecDeque::new(),
            worker_waiters: Vec::new(),
            registration_wait: config.registration_wait,
            poll_interval: config.poll_interval,
            unreachable: 0,
            broadcasts: 0,
        };

        info!(
            addr = %local_addr,
            registration_wait_ms = config.registration_wait.as_millis() as u64,
            "Dispatch router started"
        );

        let task = tokio::spawn(router.run(command_rx).instrument(info_span!("router", addr = %local_addr)));
        Ok((
            DispatchHandle {
                command_tx,
                local_addr,
            },
            task,
        ))
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<RouterCommand>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_deadline = self.waiting.front().map(|w| w.deadline);

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(RouterCommand::Shutdown { stop_workers, reply }) => {
                        let stopped = if stop_workers {
                            self.broadcast(&ControlMessage::Stop.to_frames())
                        } else {
                            0
                        };
                        let _ = reply.send(stopped);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                inbound = self.socket.recv() => match inbound {
                    Some((identity, frames)) => self.handle_inbound(identity, frames),
                    None => break,
                },
                _ = sleep_until(next_deadline) => self.expire_waiting(),
                _ = tick.tick() => {
                    trace!(
                        workers = self.registry.len(),
                        dispatched = self.registry.dispatch_count(),
                        waiting = self.waiting.len(),
                        "Router status"
                    );
                }
            }
        }

        for waiting in self.waiting.drain(..) {
            let _ = waiting.reply.send(Err(Error::channel_closed("dispatch router")));
        }
        info!(
            workers = self.registry.len(),
            dispatched = self.registry.dispatch_count(),
            "Dispatch router stopped"
        );
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Dispatch { frames, reply } => {
                if self.registry.is_empty() {
                    let now = Instant::now();
                    debug!(
                        waiting = self.waiting.len() + 1,
                        "No workers registered, holding dispatch"
                    );
                    self.waiting.push_back(WaitingDispatch {
                        frames,
                        reply,
                        queued_at: now,
                        deadline: now + self.registration_wait,
                    });
                } else {
                    let result = self.deliver(frames);
                    let _ = reply.send(result);
                }
            }
            RouterCommand::Broadcast { frames, reply } => {
                let delivered = self.broadcast(&frames);
                let _ = reply.send(delivered);
            }
            RouterCommand::Workers(reply) => {
                let _ = reply.send(self.registry.workers().to_vec());
            }
            RouterCommand::WaitForWorkers { count, reply } => {
                if self.registry.len() >= count {
                    let _ = reply.send(self.registry.len());
                } else {
                    self.worker_waiters.push((count, reply));
                }
            }
            RouterCommand::Stats(reply) => {
                let _ = reply.send(DispatchStats {
                    workers: self.registry.len(),
                    dispatched: self.registry.dispatch_count(),
                    unreachable: self.unreachable,
                    waiting: self.waiting.len(),
                    broadcasts: self.broadcasts,
                });
            }
            // Handled in the loop
            RouterCommand::Shutdown { .. } => {}
        }
    }

    fn handle_inbound(&mut self, identity: Identity, frames: Multipart) {
        if !is_registration(&frames) {
            debug!(
                worker = %identity,
                frames = frames.len(),
                "Ignoring non-registration message from worker"
            );
            return;
        }

        if !self.registry.register(identity.clone()) {
            debug!(worker = %identity, "Duplicate registration ignored");
            return;
        }
        info!(worker = %identity, workers = self.registry.len(), "Worker registered");

        self.resolve_worker_waiters(self.registry.len());

        while let Some(waiting) = self.waiting.pop_front() {
            trace!(
                held_ms = waiting.queued_at.elapsed().as_millis() as u64,
                "Releasing held dispatch"
            );
            let result = self.deliver(waiting.frames);
            let _ = waiting.reply.send(result);
        }
    }

    fn resolve_worker_waiters(&mut self, registered: usize) {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.worker_waiters)
            .into_iter()
            .partition(|(count, _)| *count <= registered);
        self.worker_waiters = pending;
        for (_, reply) in ready {
            let _ = reply.send(registered);
        }
    }

    /// Queue for the next worker in round-robin order
    ///
    /// Never waits on the worker: a gone or saturated target fails this
    /// dispatch and the cursor moves on.
    fn deliver(&mut self, frames: Multipart) -> Result<DispatchReceipt> {
        let dispatch_index = self.registry.dispatch_count();
        let worker = self
            .registry
            .next_target()
            .ok_or(Error::RegistryEmpty { waited_ms: 0 })?;

        match self.socket.try_send(&worker, frames) {
            Ok(()) => {
                debug!(worker = %worker, dispatch_index, "Dispatched");
                Ok(DispatchReceipt {
                    worker,
                    dispatch_index,
                })
            }
            Err(e) => {
                self.unreachable += 1;
                warn!(worker = %worker, dispatch_index, error = %e, "Dispatch target unreachable");
                Err(e)
            }
        }
    }

    fn broadcast(&mut self, frames: &Multipart) -> usize {
        self.broadcasts += 1;
        let mut delivered = 0;
        for worker in self.registry.workers() {
            match self.socket.try_send(worker, frames.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(worker = %worker, error = %e, "Broadcast not delivered"),
            }
        }
        info!(delivered, workers = self.registry.len(), "Broadcast sent");
        delivered
    }

    fn expire_waiting(&mut self) {
        let now = Instant::now();
        while self.waiting.front().map_or(false, |w| w.deadline <= now) {
            if let Some(waiting) = self.waiting.pop_front() {
                let waited_ms = now.duration_since(waiting.queued_at).as_millis() as u64;
                warn!(waited_ms, "No worker registered in time, dispatch failed");
                let _ = waiting.reply.send(Err(Error::RegistryEmpty { waited_ms }));
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
