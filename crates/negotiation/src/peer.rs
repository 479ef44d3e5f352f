use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beach_dispatch::{Connector, Dispatch, EndpointId};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::NegotiationConfig;
use crate::connection::{
    ConnectionEvent, DataChannel, IceCandidate, MediaTrack, PeerConnection, SessionDescription,
    SignalingPhase,
};
use crate::error::{NegotiationError, NegotiationResult};
use crate::lock::{DistributedLock, LockAction, LockFailure, RequestId, Ticket};
use crate::politeness::Role;
use crate::signal::{
    lock_payload, PeerInbox, Signal, ANSWER, ICE_CANDIDATE, LOCK_RELEASE, LOCK_REQUEST,
    LOCK_RESPONSE, OFFER,
};

const EVENT_CAPACITY: usize = 128;
const IDLE_WAKE: Duration = Duration::from_secs(3600);
const INTERNAL_TICKETS: Ticket = 1 << 63;

/// Notifications from a [`NegotiationPeer`].
#[derive(Clone)]
pub enum PeerEvent {
    PhaseChanged(SignalingPhase),
    /// Channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    Track(MediaTrack),
    /// Opaque data sent with [`NegotiationPeer::send_data`] on the other side.
    Data { from: EndpointId, data: Value },
    /// A fire-and-forget signal could not be delivered.
    SendFailed { kind: String, error: String },
    Closed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::PhaseChanged(phase) => f.debug_tuple("PhaseChanged").field(phase).finish(),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::Track(track) => f.debug_tuple("Track").field(track).finish(),
            PeerEvent::Data { from, data } => f
                .debug_struct("Data")
                .field("from", from)
                .field("data", data)
                .finish(),
            PeerEvent::SendFailed { kind, error } => f
                .debug_struct("SendFailed")
                .field("kind", kind)
                .field("error", error)
                .finish(),
            PeerEvent::Closed => f.write_str("Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub offers_ignored: u64,
    pub rollbacks: u64,
    pub candidates_queued: u64,
}

#[derive(Debug, Default)]
struct Counters {
    offers_sent: AtomicU64,
    answers_sent: AtomicU64,
    offers_ignored: AtomicU64,
    rollbacks: AtomicU64,
    candidates_queued: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> NegotiationStats {
        NegotiationStats {
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            answers_sent: self.answers_sent.load(Ordering::Relaxed),
            offers_ignored: self.offers_ignored.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            candidates_queued: self.candidates_queued.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Acquire {
        ticket: Ticket,
        reply: oneshot::Sender<NegotiationResult<RequestId>>,
    },
    Cancel {
        ticket: Ticket,
    },
    Release {
        request: RequestId,
    },
    Negotiate {
        reply: oneshot::Sender<NegotiationResult<()>>,
    },
    SendData {
        data: Value,
        reply: oneshot::Sender<NegotiationResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// One side of a perfect-negotiation session with a fixed remote endpoint.
///
/// All signaling for the pair runs on a single driver task. Operations that
/// change the connection's media take the distributed lock first so that
/// only one side renegotiates at a time; offer collisions that slip through
/// (or happen with locking disabled) are settled by politeness.
pub struct NegotiationPeer {
    local: EndpointId,
    remote: EndpointId,
    role: Role,
    config: NegotiationConfig,
    connection: Arc<dyn PeerConnection>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<PeerEvent>,
    phase: watch::Receiver<SignalingPhase>,
    counters: Arc<Counters>,
    next_ticket: AtomicU64,
    closed: AtomicBool,
}

impl NegotiationPeer {
    pub async fn open(
        local: EndpointId,
        remote: EndpointId,
        connection: Arc<dyn PeerConnection>,
        connector: &dyn Connector,
        config: NegotiationConfig,
    ) -> NegotiationResult<Self> {
        let role = Role::for_pair(&local, &remote);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inbox = PeerInbox {
            remote: remote.clone(),
            signals: signals_tx,
            events: events.clone(),
        };
        let connection_events = connection.subscribe();
        let dispatcher = connector.open(local.clone(), Arc::new(inbox)).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(connection.signaling_phase());
        let counters = Arc::new(Counters::default());

        let driver = Driver {
            remote: remote.clone(),
            role,
            config: config.clone(),
            connection: Arc::clone(&connection),
            dispatcher,
            lock: DistributedLock::new(role, config.lock()),
            waiters: HashMap::new(),
            events: events.clone(),
            phase: phase_tx,
            counters: Arc::clone(&counters),
            pending_candidates: Vec::new(),
            ignore_offer: false,
            negotiation: None,
            held: None,
            renegotiation_queued: false,
            needs_negotiation: false,
            start_internal: false,
            next_internal: INTERNAL_TICKETS,
        };
        tokio::spawn(driver.run(commands_rx, signals_rx, connection_events));
        info!(local = %local, remote = %remote, ?role, locking = config.locking, "negotiation peer open");

        Ok(Self {
            local,
            remote,
            role,
            config,
            connection,
            commands: commands_tx,
            events,
            phase: phase_rx,
            counters,
            next_ticket: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &EndpointId {
        &self.local
    }

    pub fn remote(&self) -> &EndpointId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn phase(&self) -> SignalingPhase {
        *self.phase.borrow()
    }

    pub async fn wait_for_phase(&self, phase: SignalingPhase) -> NegotiationResult<()> {
        let mut changes = self.phase.clone();
        changes
            .wait_for(|current| *current == phase)
            .await
            .map(|_| ())
            .map_err(|_| NegotiationError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> NegotiationStats {
        self.counters.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take the renegotiation lock. With locking disabled the guard is inert.
    pub async fn acquire_lock(&self) -> NegotiationResult<LockGuard> {
        self.ensure_open()?;
        if !self.config.locking {
            return Ok(LockGuard {
                request: None,
                commands: self.commands.clone(),
            });
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, granted) = oneshot::channel();
        self.commands
            .send(Command::Acquire { ticket, reply })
            .map_err(|_| NegotiationError::Closed)?;
        let mut pending = PendingAcquire {
            ticket,
            commands: self.commands.clone(),
            armed: true,
        };
        let outcome = granted.await.map_err(|_| NegotiationError::Closed);
        pending.armed = false;
        let request = outcome??;
        Ok(LockGuard {
            request: Some(request),
            commands: self.commands.clone(),
        })
    }

    /// Run one offer/answer exchange. Callers normally hold the lock.
    pub async fn negotiate(&self) -> NegotiationResult<()> {
        self.ensure_open()?;
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Negotiate { reply })
            .map_err(|_| NegotiationError::Closed)?;
        done.await.map_err(|_| NegotiationError::Closed)?
    }

    pub async fn renegotiate(&self) -> NegotiationResult<()> {
        let guard = self.acquire_lock().await?;
        self.negotiate().await?;
        guard.release();
        Ok(())
    }

    pub async fn create_data_channel(&self, label: &str) -> NegotiationResult<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        if !self.config.locking {
            return Ok(self.connection.create_data_channel(label).await?);
        }
        let guard = self.acquire_lock().await?;
        let channel = self.connection.create_data_channel(label).await?;
        self.negotiate().await?;
        guard.release();
        Ok(channel)
    }

    pub async fn add_track(&self, track: MediaTrack) -> NegotiationResult<()> {
        self.ensure_open()?;
        if !self.config.locking {
            return Ok(self.connection.add_track(track).await?);
        }
        let guard = self.acquire_lock().await?;
        self.connection.add_track(track).await?;
        self.negotiate().await?;
        guard.release();
        Ok(())
    }

    /// Send opaque data to the remote peer over the signaling channel.
    pub async fn send_data(&self, data: Value) -> NegotiationResult<()> {
        self.ensure_open()?;
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::SendData { data, reply })
            .map_err(|_| NegotiationError::Closed)?;
        done.await.map_err(|_| NegotiationError::Closed)?
    }

    /// Fail pending work, release any held lock and close the connection.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn ensure_open(&self) -> NegotiationResult<()> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for NegotiationPeer {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let (reply, _) = oneshot::channel();
            let _ = self.commands.send(Command::Close { reply });
        }
    }
}

/// Held renegotiation lock; released on [`LockGuard::release`] or drop.
pub struct LockGuard {
    request: Option<RequestId>,
    commands: mpsc::UnboundedSender<Command>,
}

impl LockGuard {
    /// `None` when locking is disabled.
    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(request) = self.request.take() {
            let _ = self.commands.send(Command::Release { request });
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

struct PendingAcquire {
    ticket: Ticket,
    commands: mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel {
                ticket: self.ticket,
            });
        }
    }
}

enum Waiter {
    Caller(oneshot::Sender<NegotiationResult<RequestId>>),
    Internal,
}

struct Hold {
    ticket: Ticket,
    request: RequestId,
    internal: bool,
    negotiated: bool,
    settle_at: Option<Instant>,
}

struct Negotiation {
    reply: Option<oneshot::Sender<NegotiationResult<()>>>,
    deadline: Instant,
    reoffer: bool,
}

struct Driver {
    remote: EndpointId,
    role: Role,
    config: NegotiationConfig,
    connection: Arc<dyn PeerConnection>,
    dispatcher: Arc<dyn Dispatch>,
    lock: DistributedLock,
    waiters: HashMap<Ticket, Waiter>,
    events: broadcast::Sender<PeerEvent>,
    phase: watch::Sender<SignalingPhase>,
    counters: Arc<Counters>,
    pending_candidates: Vec<IceCandidate>,
    ignore_offer: bool,
    negotiation: Option<Negotiation>,
    held: Option<Hold>,
    renegotiation_queued: bool,
    needs_negotiation: bool,
    start_internal: bool,
    next_internal: Ticket,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        mut connection_events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let mut events_open = true;
        loop {
            let wake = self
                .next_wake()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                biased;
                event = connection_events.recv(), if events_open => match event {
                    Ok(event) => self.on_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(remote = %self.remote, skipped, "connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                Some(signal) = signals.recv() => self.on_signal(signal).await,
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(wake) => self.on_timer().await,
            }
            if std::mem::take(&mut self.start_internal) {
                self.start_negotiation(None).await;
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        [
            self.lock.next_deadline(),
            self.negotiation.as_ref().map(|n| n.deadline),
            self.held.as_ref().and_then(|hold| hold.settle_at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Acquire { ticket, reply } => {
                self.waiters.insert(ticket, Waiter::Caller(reply));
                let actions = self.lock.acquire(ticket, now);
                self.apply(actions).await;
            }
            Command::Cancel { ticket } => {
                if self.waiters.remove(&ticket).is_some() {
                    let actions = self.lock.cancel(ticket, now);
                    self.apply(actions).await;
                    return;
                }
                // granted, but the caller went away before taking the guard
                let orphaned = self
                    .held
                    .as_ref()
                    .filter(|hold| hold.ticket == ticket)
                    .map(|hold| hold.request);
                if let Some(request) = orphaned {
                    debug!(remote = %self.remote, request, "releasing lock granted to a dropped caller");
                    self.release_hold(request).await;
                }
            }
            Command::Release { request } => self.release_hold(request).await,
            Command::Negotiate { reply } => self.start_negotiation(Some(reply)).await,
            Command::SendData { data, reply } => {
                let result = self
                    .dispatcher
                    .send(&self.remote, "", data)
                    .await
                    .map_err(NegotiationError::from);
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        let now = Instant::now();
        match signal {
            Signal::LockRequest(request) => {
                let actions = self.lock.on_request(request, now);
                self.apply(actions).await;
            }
            Signal::LockResponse(request) => {
                let actions = self.lock.on_response(request);
                self.apply(actions).await;
            }
            Signal::LockRelease(request) => {
                let actions = self.lock.on_release(request, now);
                self.apply(actions).await;
            }
            Signal::Offer(offer) => self.on_offer(offer).await,
            Signal::Answer(answer) => self.on_answer(answer).await,
            Signal::Candidate(candidate) => self.on_candidate(candidate).await,
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::SignalingStateChange(_) => self.sync_phase(),
            ConnectionEvent::IceCandidate(candidate) => match serde_json::to_value(&candidate) {
                Ok(payload) => self.send_or_report(ICE_CANDIDATE, payload).await,
                Err(err) => warn!(error = %err, "cannot encode local candidate"),
            },
            ConnectionEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            ConnectionEvent::DataChannel(channel) => {
                debug!(remote = %self.remote, label = channel.label(), "remote data channel");
                let _ = self.events.send(PeerEvent::DataChannel(channel));
            }
            ConnectionEvent::Track(track) => {
                let _ = self.events.send(PeerEvent::Track(track));
            }
        }
    }

    async fn on_negotiation_needed(&mut self) {
        if !self.config.locking {
            if self.negotiation.is_none()
                && self.connection.signaling_phase() == SignalingPhase::Stable
            {
                self.start_negotiation(None).await;
            }
            return;
        }
        if self.negotiation.is_some() || self.held.is_some() {
            // the current holder's exchange may already cover it
            self.needs_negotiation = true;
            return;
        }
        self.queue_renegotiation().await;
    }

    async fn queue_renegotiation(&mut self) {
        if self.renegotiation_queued {
            return;
        }
        self.renegotiation_queued = true;
        self.needs_negotiation = false;
        let ticket = self.next_internal;
        self.next_internal += 1;
        self.waiters.insert(ticket, Waiter::Internal);
        debug!(remote = %self.remote, "queueing renegotiation under the lock");
        let actions = self.lock.acquire(ticket, Instant::now());
        self.apply(actions).await;
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        if self
            .negotiation
            .as_ref()
            .is_some_and(|negotiation| negotiation.deadline <= now)
        {
            warn!(remote = %self.remote, "negotiation timed out");
            if self.connection.signaling_phase() == SignalingPhase::HaveLocalOffer {
                let _ = self
                    .connection
                    .set_local_description(SessionDescription::rollback())
                    .await;
                self.sync_phase();
            }
            self.finish_negotiation(Err(NegotiationError::NegotiationTimeout(
                self.remote.clone(),
            )))
            .await;
        }
        let settled = self
            .held
            .as_ref()
            .filter(|hold| hold.settle_at.is_some_and(|at| at <= now))
            .map(|hold| hold.request);
        if let Some(request) = settled {
            warn!(remote = %self.remote, request, "releasing lock left held after negotiation settled");
            self.release_hold(request).await;
        }
        let actions = self.lock.poll(now);
        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<LockAction>) {
        let mut queue: VecDeque<LockAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                LockAction::SendRequest(request) => {
                    trace!(remote = %self.remote, request, "lock request");
                    if let Err(err) = self.send_signal(LOCK_REQUEST, lock_payload(request)).await {
                        warn!(remote = %self.remote, error = %err, "lock request undeliverable");
                        queue.extend(self.lock.abort(request, Instant::now()));
                    }
                }
                LockAction::SendResponse(request) => {
                    self.send_or_report(LOCK_RESPONSE, lock_payload(request)).await;
                }
                LockAction::SendRelease(request) => {
                    self.send_or_report(LOCK_RELEASE, lock_payload(request)).await;
                }
                LockAction::Granted { ticket, request } => match self.waiters.remove(&ticket) {
                    Some(Waiter::Caller(reply)) => {
                        if reply.send(Ok(request)).is_ok() {
                            self.held = Some(Hold {
                                ticket,
                                request,
                                internal: false,
                                negotiated: false,
                                settle_at: None,
                            });
                        } else {
                            queue.extend(self.lock.release(request, Instant::now()));
                        }
                    }
                    Some(Waiter::Internal) => {
                        self.renegotiation_queued = false;
                        self.held = Some(Hold {
                            ticket,
                            request,
                            internal: true,
                            negotiated: false,
                            settle_at: None,
                        });
                        self.start_internal = true;
                    }
                    None => queue.extend(self.lock.release(request, Instant::now())),
                },
                LockAction::Failed { ticket, failure } => {
                    let error = match failure {
                        LockFailure::Timeout => NegotiationError::LockTimeout(self.remote.clone()),
                        LockFailure::Unreachable => {
                            NegotiationError::Unreachable(self.remote.clone())
                        }
                        LockFailure::Closed => NegotiationError::Closed,
                    };
                    match self.waiters.remove(&ticket) {
                        Some(Waiter::Caller(reply)) => {
                            let _ = reply.send(Err(error));
                        }
                        Some(Waiter::Internal) => {
                            self.renegotiation_queued = false;
                            warn!(remote = %self.remote, error = %error, "renegotiation could not take the lock");
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn release_hold(&mut self, request: RequestId) {
        if self.held.as_ref().map(|hold| hold.request) == Some(request) {
            self.held = None;
        }
        let actions = self.lock.release(request, Instant::now());
        self.apply(actions).await;
        if self.needs_negotiation && self.negotiation.is_none() && self.held.is_none() {
            self.queue_renegotiation().await;
        }
    }

    async fn release_internal_hold(&mut self) {
        let internal = self
            .held
            .as_ref()
            .filter(|hold| hold.internal)
            .map(|hold| hold.request);
        if let Some(request) = internal {
            self.release_hold(request).await;
        }
    }

    async fn start_negotiation(&mut self, reply: Option<oneshot::Sender<NegotiationResult<()>>>) {
        let refusal = if self.negotiation.is_some() {
            Some(NegotiationError::Busy)
        } else {
            match self.connection.signaling_phase() {
                SignalingPhase::Stable => None,
                phase => Some(NegotiationError::NotStable(phase)),
            }
        };
        if let Some(error) = refusal {
            debug!(remote = %self.remote, error = %error, "not starting negotiation");
            if let Some(reply) = reply {
                let _ = reply.send(Err(error));
            }
            self.release_internal_hold().await;
            return;
        }

        if let Some(hold) = self.held.as_mut() {
            hold.negotiated = true;
            hold.settle_at = None;
        }
        self.negotiation = Some(Negotiation {
            reply,
            deadline: Instant::now() + self.config.negotiation_timeout,
            reoffer: false,
        });
        if let Err(err) = self.offer().await {
            self.finish_negotiation(Err(err)).await;
        }
    }

    async fn offer(&mut self) -> NegotiationResult<()> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.sync_phase();
        let payload = serde_json::to_value(&offer)?;
        if let Err(err) = self.send_signal(OFFER, payload).await {
            let _ = self
                .connection
                .set_local_description(SessionDescription::rollback())
                .await;
            self.sync_phase();
            return Err(err);
        }
        Counters::bump(&self.counters.offers_sent);
        debug!(remote = %self.remote, "offer sent");
        Ok(())
    }

    async fn finish_negotiation(&mut self, result: NegotiationResult<()>) {
        let Some(negotiation) = self.negotiation.take() else {
            return;
        };
        let succeeded = result.is_ok();
        match &result {
            Ok(()) => {
                self.needs_negotiation = false;
                debug!(remote = %self.remote, "negotiation complete");
            }
            Err(err) => warn!(remote = %self.remote, error = %err, "negotiation failed"),
        }
        if let Some(reply) = negotiation.reply {
            let _ = reply.send(result);
        }
        let internal = self
            .held
            .as_ref()
            .filter(|hold| hold.internal)
            .map(|hold| hold.request);
        if let Some(request) = internal {
            self.release_hold(request).await;
        } else if succeeded {
            let settle_at = Instant::now() + self.config.settle_delay;
            if let Some(hold) = self.held.as_mut() {
                hold.settle_at = Some(settle_at);
            }
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        let phase = self.connection.signaling_phase();
        let collision = phase != SignalingPhase::Stable;
        self.ignore_offer = collision && !self.role.is_polite();
        if self.ignore_offer {
            Counters::bump(&self.counters.offers_ignored);
            debug!(remote = %self.remote, ?phase, "ignoring colliding offer");
            return;
        }
        if collision {
            if phase != SignalingPhase::HaveLocalOffer {
                warn!(remote = %self.remote, ?phase, "offer arrived mid-answer; dropping it");
                return;
            }
            if let Err(err) = self
                .connection
                .set_local_description(SessionDescription::rollback())
                .await
            {
                warn!(remote = %self.remote, error = %err, "rollback failed");
                return;
            }
            Counters::bump(&self.counters.rollbacks);
            info!(remote = %self.remote, "rolled back local offer for colliding remote offer");
            if let Some(negotiation) = self.negotiation.as_mut() {
                negotiation.reoffer = true;
            }
        }

        if let Err(err) = self.answer(offer).await {
            warn!(remote = %self.remote, error = %err, "cannot answer remote offer");
            let _ = self.events.send(PeerEvent::SendFailed {
                kind: ANSWER.into(),
                error: err.to_string(),
            });
        }

        let reoffer = self
            .negotiation
            .as_mut()
            .map(|negotiation| std::mem::take(&mut negotiation.reoffer))
            .unwrap_or(false);
        if reoffer && self.connection.signaling_phase() == SignalingPhase::Stable {
            if let Err(err) = self.offer().await {
                self.finish_negotiation(Err(err)).await;
            }
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> NegotiationResult<()> {
        self.connection.set_remote_description(offer).await?;
        self.sync_phase();
        self.flush_candidates().await;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.sync_phase();
        self.send_signal(ANSWER, serde_json::to_value(&answer)?)
            .await?;
        Counters::bump(&self.counters.answers_sent);
        debug!(remote = %self.remote, "answer sent");
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if self.connection.signaling_phase() != SignalingPhase::HaveLocalOffer {
            debug!(remote = %self.remote, "ignoring answer outside have-local-offer");
            return;
        }
        match self.connection.set_remote_description(answer).await {
            Ok(()) => {
                self.ignore_offer = false;
                self.sync_phase();
                self.flush_candidates().await;
                if self.connection.signaling_phase() == SignalingPhase::Stable {
                    self.finish_negotiation(Ok(())).await;
                }
            }
            Err(err) => {
                warn!(remote = %self.remote, error = %err, "cannot apply remote answer");
                self.finish_negotiation(Err(err.into())).await;
            }
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if self.ignore_offer {
            trace!(remote = %self.remote, "dropping candidate for ignored offer");
            return;
        }
        if !self.connection.has_remote_description() {
            Counters::bump(&self.counters.candidates_queued);
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(err) = self.connection.add_ice_candidate(candidate).await {
            warn!(remote = %self.remote, error = %err, "remote candidate rejected");
        }
    }

    async fn flush_candidates(&mut self) {
        if !self.connection.has_remote_description() {
            return;
        }
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, error = %err, "queued candidate rejected");
            }
        }
    }

    fn sync_phase(&self) {
        let phase = self.connection.signaling_phase();
        if *self.phase.borrow() != phase {
            self.phase.send_replace(phase);
            let _ = self.events.send(PeerEvent::PhaseChanged(phase));
        }
    }

    async fn send_signal(&self, kind: &str, payload: Value) -> NegotiationResult<()> {
        self.dispatcher
            .send(&self.remote, kind, payload)
            .await
            .map_err(NegotiationError::from)
    }

    async fn send_or_report(&self, kind: &str, payload: Value) {
        if let Err(err) = self.send_signal(kind, payload).await {
            warn!(remote = %self.remote, kind, error = %err, "signal undeliverable");
            let _ = self.events.send(PeerEvent::SendFailed {
                kind: kind.to_string(),
                error: err.to_string(),
            });
        }
    }

    async fn shutdown(&mut self) {
        info!(remote = %self.remote, "closing negotiation peer");
        if let Some(negotiation) = self.negotiation.take() {
            if let Some(reply) = negotiation.reply {
                let _ = reply.send(Err(NegotiationError::Closed));
            }
        }
        for action in self.lock.close() {
            match action {
                LockAction::Failed { ticket, .. } => {
                    if let Some(Waiter::Caller(reply)) = self.waiters.remove(&ticket) {
                        let _ = reply.send(Err(NegotiationError::Closed));
                    }
                }
                LockAction::SendRelease(request) => {
                    let _ = self.send_signal(LOCK_RELEASE, lock_payload(request)).await;
                }
                _ => {}
            }
        }
        self.waiters.clear();
        self.held = None;
        self.dispatcher.close();
        self.connection.close().await;
        let _ = self.events.send(PeerEvent::Closed);
    }
}
