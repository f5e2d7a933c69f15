//! Relay/NAT-Traversal Negotiator
//!
//! One negotiator runs per peer pair. The state machine itself is a pure
//! function: `transition(state, event, ctx)` returns the next state and the
//! side effects to perform. `PairNegotiator` is the task that owns the state,
//! feeds it events from a single mpsc queue and executes the actions.
//!
//! ```text
//! Idle -> Probing -> Direct
//!             |  \-> Relayed
//!             \-> Failed --(backoff)--> Idle
//! ```
//!
//! Probing runs in stages: wait for the remote candidates over the signal
//! channel, probe them in preference order, then fall back to a relay slot
//! and exchange relayed endpoints. A relay offer from the remote at any
//! point moves both sides onto the relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshlink_crypto::{Nonce, PublicKey};
use meshlink_network::protocol::{encode, preference_order};
use meshlink_network::{
    Candidate, NegotiationMessage, PeerPath, PeerTransport, RelayClient, RelayEndpoint, SignalChannel,
};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::NegotiatorConfig;
use crate::error::{CoreError, CoreResult};

// ============ Seams ============

/// Verifies a direct path to a remote candidate
#[async_trait]
pub trait DirectProber: Send + Sync {
    /// Handshake with `remote` at `addr`; returns the address that answered
    async fn probe(
        &self,
        remote: PublicKey,
        addr: SocketAddr,
        negotiation: Nonce,
        timeout: Duration,
    ) -> CoreResult<SocketAddr>;
}

#[async_trait]
impl DirectProber for PeerTransport {
    async fn probe(
        &self,
        remote: PublicKey,
        addr: SocketAddr,
        negotiation: Nonce,
        timeout: Duration,
    ) -> CoreResult<SocketAddr> {
        let (from, _rtt) = PeerTransport::probe(self, remote, addr, negotiation, timeout).await?;
        Ok(from)
    }
}

/// Hands out relay slots towards a remote peer
#[async_trait]
pub trait RelayAllocator: Send + Sync {
    async fn allocate(&self, remote: PublicKey) -> CoreResult<RelayEndpoint>;
    async fn release(&self, remote: PublicKey) -> CoreResult<()>;
}

#[async_trait]
impl RelayAllocator for RelayClient {
    async fn allocate(&self, remote: PublicKey) -> CoreResult<RelayEndpoint> {
        Ok(RelayClient::allocate(self, remote).await?)
    }

    async fn release(&self, remote: PublicKey) -> CoreResult<()> {
        Ok(RelayClient::release(self, remote).await?)
    }
}

// ============ State machine ============

/// Which side of the pair sends the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The lexicographically greater key initiates
    pub fn for_pair(local: &PublicKey, remote: &PublicKey) -> Self {
        if local > remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Progress inside `Probing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    /// Waiting for the remote's offer or answer
    Signalling,
    /// Probing the remote's candidates
    Direct,
    /// Relay allocation in flight
    Allocating,
    /// Own relay slot ready, waiting for the remote's relayed endpoint
    AwaitingRelayPeer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probing {
    /// Our negotiation id
    pub negotiation: Nonce,
    /// The remote's negotiation id, once heard
    pub remote: Option<Nonce>,
    pub stage: ProbeStage,
    /// Failed attempts so far
    pub attempt: u32,
    pub own_relay: Option<RelayEndpoint>,
    pub their_relay: Option<RelayEndpoint>,
}

/// Negotiator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle {
        attempt: u32,
    },
    Probing(Probing),
    Direct {
        negotiation: Nonce,
        remote: Option<Nonce>,
        addr: SocketAddr,
    },
    Relayed {
        negotiation: Nonce,
        remote: Option<Nonce>,
        own: RelayEndpoint,
        theirs: Option<RelayEndpoint>,
    },
    Failed {
        attempt: u32,
    },
}

impl NegotiationState {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::Idle { .. } => "Idle",
            NegotiationState::Probing(_) => "Probing",
            NegotiationState::Direct { .. } => "Direct",
            NegotiationState::Relayed { .. } => "Relayed",
            NegotiationState::Failed { .. } => "Failed",
        }
    }

    /// Our current negotiation id
    pub fn negotiation(&self) -> Option<Nonce> {
        match self {
            NegotiationState::Probing(p) => Some(p.negotiation),
            NegotiationState::Direct { negotiation, .. } | NegotiationState::Relayed { negotiation, .. } => {
                Some(*negotiation)
            }
            NegotiationState::Idle { .. } | NegotiationState::Failed { .. } => None,
        }
    }

    /// The remote's negotiation id as last heard
    pub fn remote(&self) -> Option<Nonce> {
        match self {
            NegotiationState::Probing(p) => p.remote,
            NegotiationState::Direct { remote, .. } | NegotiationState::Relayed { remote, .. } => *remote,
            NegotiationState::Idle { .. } | NegotiationState::Failed { .. } => None,
        }
    }

    /// Path in use, if the pair is connected
    pub fn path(&self) -> Option<PeerPath> {
        match self {
            NegotiationState::Direct { addr, .. } => Some(PeerPath::Direct(*addr)),
            NegotiationState::Relayed { own, .. } => Some(PeerPath::Relayed(own.relay_addr)),
            _ => None,
        }
    }

    /// Whether a relay slot may be held (or be in flight)
    pub fn holds_relay(&self) -> bool {
        match self {
            NegotiationState::Relayed { .. } => true,
            NegotiationState::Probing(p) => p.own_relay.is_some() || p.stage == ProbeStage::Allocating,
            _ => false,
        }
    }
}

/// Timers armed by the state machine. Each carries the negotiation id (or
/// failed attempt) it was armed for so a stale firing is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Signal(Nonce),
    RelayWait(Nonce),
    Backoff(u32),
}

/// Inputs of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Begin a negotiation from `Idle`
    Start,
    /// Message from the remote over the signal channel
    Remote(NegotiationMessage),
    /// A probe round found a direct path
    ProbeSucceeded { negotiation: Nonce, addr: SocketAddr },
    /// A probe round exhausted every candidate
    ProbeExhausted { negotiation: Nonce },
    RelayAllocated { negotiation: Nonce, endpoint: RelayEndpoint },
    RelayFailed { negotiation: Nonce, reason: String },
    TimerFired(Timer),
    /// The session layer saw the established path die
    PathLost,
}

/// Outcome reported to the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Established(PeerPath),
    /// A path we reported is gone; negotiation restarted
    Lost,
    Failed { attempt: u32, retry_in: Duration },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendOffer { negotiation: Nonce },
    SendAnswer { negotiation: Nonce },
    SendRelayOffer { negotiation: Nonce, endpoint: RelayEndpoint },
    SendTeardown { negotiation: Nonce },
    Probe { negotiation: Nonce, candidates: Vec<Candidate> },
    CancelProbe,
    AllocateRelay { negotiation: Nonce },
    ReleaseRelay,
    Arm { timer: Timer, after: Duration },
    /// Feed `Start` back in with a fresh negotiation id
    Restart,
    Report(Report),
}

/// Next state plus the actions to execute, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: NegotiationState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn stay(state: &NegotiationState) -> Self {
        Self {
            state: state.clone(),
            actions: Vec::new(),
        }
    }
}

/// Inputs of a transition that are not part of the state
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub role: Role,
    pub config: &'a NegotiatorConfig,
    /// Negotiation id to use if this step starts a new negotiation
    pub fresh: Nonce,
    /// Uniform sample in [0, 1) for backoff jitter
    pub jitter: f64,
}

/// Retry delay after `attempt` consecutive failures (1-based).
///
/// `base * 2^(attempt-1)` capped at `cap`, then scaled by
/// `1 + jitter * (2 * sample - 1)`.
pub fn backoff(config: &NegotiatorConfig, attempt: u32, sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let raw = config.backoff_base.saturating_mul(1u32 << exponent);
    let capped = raw.min(config.backoff_cap);
    let factor = 1.0 + config.backoff_jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
    capped.mul_f64(factor.max(0.0))
}

/// Enter `Probing` for a fresh negotiation that has not heard the remote
fn begin(ctx: &StepContext<'_>, negotiation: Nonce, attempt: u32) -> Transition {
    let mut actions = Vec::new();
    if ctx.role == Role::Initiator {
        actions.push(Action::SendOffer { negotiation });
    }
    actions.push(Action::Arm {
        timer: Timer::Signal(negotiation),
        after: ctx.config.signal_timeout,
    });
    Transition {
        state: NegotiationState::Probing(Probing {
            negotiation,
            remote: None,
            stage: ProbeStage::Signalling,
            attempt,
            own_relay: None,
            their_relay: None,
        }),
        actions,
    }
}

/// Enter `Probing` with the remote's candidates in hand
fn probe_remote(
    negotiation: Nonce,
    remote: Nonce,
    attempt: u32,
    candidates: Vec<Candidate>,
    mut actions: Vec<Action>,
) -> Transition {
    let stage = if candidates.is_empty() {
        actions.push(Action::AllocateRelay { negotiation });
        ProbeStage::Allocating
    } else {
        actions.push(Action::Probe { negotiation, candidates });
        ProbeStage::Direct
    };
    Transition {
        state: NegotiationState::Probing(Probing {
            negotiation,
            remote: Some(remote),
            stage,
            attempt,
            own_relay: None,
            their_relay: None,
        }),
        actions,
    }
}

/// Actions that leave whatever the current state holds
fn abandon(state: &NegotiationState) -> Vec<Action> {
    let mut actions = Vec::new();
    match state {
        NegotiationState::Probing(p) if p.stage == ProbeStage::Direct => actions.push(Action::CancelProbe),
        NegotiationState::Direct { .. } | NegotiationState::Relayed { .. } => actions.push(Action::Report(Report::Lost)),
        _ => {}
    }
    if state.holds_relay() {
        actions.push(Action::ReleaseRelay);
    }
    actions
}

fn fail(ctx: &StepContext<'_>, attempt: u32, mut actions: Vec<Action>) -> Transition {
    let attempt = attempt.saturating_add(1);
    let retry_in = backoff(ctx.config, attempt, ctx.jitter);
    actions.push(Action::Report(Report::Failed { attempt, retry_in }));
    actions.push(Action::Arm {
        timer: Timer::Backoff(attempt),
        after: retry_in,
    });
    Transition {
        state: NegotiationState::Failed { attempt },
        actions,
    }
}

fn attempt_of(state: &NegotiationState) -> u32 {
    match state {
        NegotiationState::Idle { attempt } | NegotiationState::Failed { attempt } => *attempt,
        NegotiationState::Probing(p) => p.attempt,
        _ => 0,
    }
}

/// The negotiator's transition function
pub fn transition(state: &NegotiationState, event: NegotiationEvent, ctx: &StepContext<'_>) -> Transition {
    use NegotiationState as S;

    match event {
        NegotiationEvent::Start => match state {
            S::Idle { attempt } => begin(ctx, ctx.fresh, *attempt),
            _ => Transition::stay(state),
        },

        NegotiationEvent::Remote(NegotiationMessage::Offer { negotiation: r, candidates }) => {
            if state.remote() == Some(r) {
                // Redelivered offer: answer again, keep probing
                return match state.negotiation() {
                    Some(local) => Transition {
                        state: state.clone(),
                        actions: vec![Action::SendAnswer { negotiation: local }],
                    },
                    None => Transition::stay(state),
                };
            }

            match state {
                S::Probing(p) if p.remote.is_none() && p.stage == ProbeStage::Signalling => {
                    let actions = vec![Action::SendAnswer { negotiation: p.negotiation }];
                    probe_remote(p.negotiation, r, p.attempt, candidates, actions)
                }
                _ => {
                    // Remote restarted, or reached out while we were idle
                    debug!("New remote negotiation in {}, restarting", state.name());
                    let mut actions = abandon(state);
                    actions.push(Action::SendAnswer { negotiation: ctx.fresh });
                    probe_remote(ctx.fresh, r, attempt_of(state), candidates, actions)
                }
            }
        }

        NegotiationEvent::Remote(NegotiationMessage::Answer { negotiation: r, candidates }) => match state {
            S::Probing(p) if p.stage == ProbeStage::Signalling && p.remote.is_none() => {
                probe_remote(p.negotiation, r, p.attempt, candidates, Vec::new())
            }
            _ => Transition::stay(state),
        },

        NegotiationEvent::Remote(NegotiationMessage::RelayOffer { negotiation: r, endpoint }) => match state {
            S::Probing(p) => {
                let mut next = p.clone();
                next.remote = Some(r);
                next.their_relay = Some(endpoint);
                let mut actions = Vec::new();
                match p.stage {
                    ProbeStage::Signalling | ProbeStage::Direct => {
                        if p.stage == ProbeStage::Direct {
                            actions.push(Action::CancelProbe);
                        }
                        next.stage = ProbeStage::Allocating;
                        actions.push(Action::AllocateRelay { negotiation: p.negotiation });
                    }
                    ProbeStage::Allocating => {}
                    ProbeStage::AwaitingRelayPeer => {
                        if let Some(own) = p.own_relay {
                            actions.push(Action::Report(Report::Established(PeerPath::Relayed(own.relay_addr))));
                            return Transition {
                                state: S::Relayed {
                                    negotiation: p.negotiation,
                                    remote: Some(r),
                                    own,
                                    theirs: Some(endpoint),
                                },
                                actions,
                            };
                        }
                    }
                }
                Transition {
                    state: S::Probing(next),
                    actions,
                }
            }
            S::Direct { negotiation, .. } => {
                // The remote could not confirm the direct path; follow it onto the relay
                Transition {
                    state: S::Probing(Probing {
                        negotiation: *negotiation,
                        remote: Some(r),
                        stage: ProbeStage::Allocating,
                        attempt: 0,
                        own_relay: None,
                        their_relay: Some(endpoint),
                    }),
                    actions: vec![
                        Action::Report(Report::Lost),
                        Action::AllocateRelay { negotiation: *negotiation },
                    ],
                }
            }
            S::Relayed { negotiation, own, .. } => Transition {
                state: S::Relayed {
                    negotiation: *negotiation,
                    remote: Some(r),
                    own: *own,
                    theirs: Some(endpoint),
                },
                actions: Vec::new(),
            },
            S::Idle { attempt } | S::Failed { attempt } => Transition {
                state: S::Probing(Probing {
                    negotiation: ctx.fresh,
                    remote: Some(r),
                    stage: ProbeStage::Allocating,
                    attempt: *attempt,
                    own_relay: None,
                    their_relay: Some(endpoint),
                }),
                actions: vec![Action::AllocateRelay { negotiation: ctx.fresh }],
            },
        },

        NegotiationEvent::Remote(NegotiationMessage::Teardown { negotiation: r }) => {
            if state.remote() != Some(r) {
                trace!("Ignoring teardown for an unknown negotiation");
                return Transition::stay(state);
            }
            let mut next = begin(ctx, ctx.fresh, 0);
            let mut actions = abandon(state);
            actions.append(&mut next.actions);
            next.actions = actions;
            next
        }

        NegotiationEvent::ProbeSucceeded { negotiation, addr } => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::Direct => Transition {
                state: S::Direct {
                    negotiation,
                    remote: p.remote,
                    addr,
                },
                actions: vec![Action::Report(Report::Established(PeerPath::Direct(addr)))],
            },
            _ => Transition::stay(state),
        },

        NegotiationEvent::ProbeExhausted { negotiation } => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::Direct => {
                let mut next = p.clone();
                next.stage = ProbeStage::Allocating;
                Transition {
                    state: S::Probing(next),
                    actions: vec![Action::AllocateRelay { negotiation }],
                }
            }
            _ => Transition::stay(state),
        },

        NegotiationEvent::RelayAllocated { negotiation, endpoint } => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::Allocating => {
                let mut actions = vec![Action::SendRelayOffer { negotiation, endpoint }];
                match p.their_relay {
                    Some(theirs) => {
                        actions.push(Action::Report(Report::Established(PeerPath::Relayed(endpoint.relay_addr))));
                        Transition {
                            state: S::Relayed {
                                negotiation,
                                remote: p.remote,
                                own: endpoint,
                                theirs: Some(theirs),
                            },
                            actions,
                        }
                    }
                    None => {
                        actions.push(Action::Arm {
                            timer: Timer::RelayWait(negotiation),
                            after: ctx.config.relay_wait,
                        });
                        let mut next = p.clone();
                        next.stage = ProbeStage::AwaitingRelayPeer;
                        next.own_relay = Some(endpoint);
                        Transition {
                            state: S::Probing(next),
                            actions,
                        }
                    }
                }
            }
            // Allocation outlived its negotiation
            _ if !state.holds_relay() => Transition {
                state: state.clone(),
                actions: vec![Action::ReleaseRelay],
            },
            _ => Transition::stay(state),
        },

        NegotiationEvent::RelayFailed { negotiation, reason } => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::Allocating => {
                debug!("Relay allocation failed: {}", reason);
                fail(ctx, p.attempt, Vec::new())
            }
            _ => Transition::stay(state),
        },

        NegotiationEvent::TimerFired(Timer::Signal(negotiation)) => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::Signalling => {
                let mut next = p.clone();
                next.stage = ProbeStage::Allocating;
                Transition {
                    state: S::Probing(next),
                    actions: vec![Action::AllocateRelay { negotiation }],
                }
            }
            _ => Transition::stay(state),
        },

        NegotiationEvent::TimerFired(Timer::RelayWait(negotiation)) => match state {
            S::Probing(p) if p.negotiation == negotiation && p.stage == ProbeStage::AwaitingRelayPeer => {
                match (p.remote, p.own_relay) {
                    (Some(_), Some(own)) => Transition {
                        state: S::Relayed {
                            negotiation,
                            remote: p.remote,
                            own,
                            theirs: None,
                        },
                        actions: vec![Action::Report(Report::Established(PeerPath::Relayed(own.relay_addr)))],
                    },
                    // Never heard from the remote at all
                    _ => fail(ctx, p.attempt, vec![Action::ReleaseRelay]),
                }
            }
            _ => Transition::stay(state),
        },

        NegotiationEvent::TimerFired(Timer::Backoff(armed)) => match state {
            S::Failed { attempt } if *attempt == armed => Transition {
                state: S::Idle { attempt: *attempt },
                actions: vec![Action::Restart],
            },
            _ => Transition::stay(state),
        },

        NegotiationEvent::PathLost => match state {
            S::Direct { negotiation, .. } | S::Relayed { negotiation, .. } => {
                let mut actions = vec![Action::SendTeardown { negotiation: *negotiation }];
                if state.holds_relay() {
                    actions.push(Action::ReleaseRelay);
                }
                let mut next = begin(ctx, ctx.fresh, 0);
                actions.append(&mut next.actions);
                next.actions = actions;
                next
            }
            _ => Transition::stay(state),
        },
    }
}

// ============ Driver ============

/// What a negotiator tells the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorUpdate {
    pub peer: PublicKey,
    pub report: Report,
}

/// Everything a negotiator needs besides its own state
#[derive(Clone)]
pub struct NegotiatorDeps {
    pub local: PublicKey,
    pub signal: Arc<dyn SignalChannel>,
    pub prober: Arc<dyn DirectProber>,
    pub relay: Option<Arc<dyn RelayAllocator>>,
    /// Our current address candidates
    pub candidates: watch::Receiver<Vec<Candidate>>,
    pub config: NegotiatorConfig,
}

/// Handle to a running pair negotiator
pub struct NegotiatorHandle {
    remote: PublicKey,
    events: mpsc::Sender<NegotiationEvent>,
    state: watch::Receiver<NegotiationState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl NegotiatorHandle {
    pub fn remote(&self) -> PublicKey {
        self.remote
    }

    pub fn state(&self) -> NegotiationState {
        self.state.borrow().clone()
    }

    /// Follow state changes
    pub fn watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Sender side of the negotiator's queue
    pub fn inbox(&self) -> NegotiatorInbox {
        NegotiatorInbox {
            remote: self.remote,
            events: self.events.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the negotiator and wait for it to signal teardown and release
    /// its relay slot
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("Negotiator for {} did not stop in time", self.remote.short());
            task.abort();
        }
    }
}

/// Cloneable input side of a negotiator
#[derive(Clone)]
pub struct NegotiatorInbox {
    remote: PublicKey,
    events: mpsc::Sender<NegotiationEvent>,
}

impl NegotiatorInbox {
    /// Hand a signal message from the remote to the negotiator
    pub async fn deliver(&self, msg: NegotiationMessage) {
        if self.events.send(NegotiationEvent::Remote(msg)).await.is_err() {
            trace!("Negotiator for {} is gone", self.remote.short());
        }
    }

    /// The established path stopped answering
    pub async fn path_lost(&self) {
        let _ = self.events.send(NegotiationEvent::PathLost).await;
    }
}

/// Pair negotiator task
pub struct PairNegotiator {
    remote: PublicKey,
    role: Role,
    deps: NegotiatorDeps,
    state: NegotiationState,
    state_tx: watch::Sender<NegotiationState>,
    events_tx: mpsc::Sender<NegotiationEvent>,
    events_rx: mpsc::Receiver<NegotiationEvent>,
    updates: mpsc::Sender<NegotiatorUpdate>,
    cancel: CancellationToken,
    probe: Option<CancellationToken>,
}

impl PairNegotiator {
    /// Spawn a negotiator for `remote`. It starts immediately and runs until
    /// `cancel` fires or the handle is shut down.
    pub fn spawn(
        remote: PublicKey,
        deps: NegotiatorDeps,
        updates: mpsc::Sender<NegotiatorUpdate>,
        cancel: CancellationToken,
    ) -> NegotiatorHandle {
        let role = Role::for_pair(&deps.local, &remote);
        let initial = NegotiationState::Idle { attempt: 0 };
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let (events_tx, events_rx) = mpsc::channel(64);

        let negotiator = PairNegotiator {
            remote,
            role,
            deps,
            state: initial,
            state_tx,
            events_tx: events_tx.clone(),
            events_rx,
            updates,
            cancel: cancel.clone(),
            probe: None,
        };
        let task = tokio::spawn(negotiator.run());

        NegotiatorHandle {
            remote,
            events: events_tx,
            state: state_rx,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        debug!("Negotiator for {} started as {:?}", self.remote.short(), self.role);
        self.step(NegotiationEvent::Start).await;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.step(event).await;
        }

        self.cleanup().await;
        debug!("Negotiator for {} stopped", self.remote.short());
    }

    async fn step(&mut self, event: NegotiationEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let ctx = StepContext {
                role: self.role,
                config: &self.deps.config,
                fresh: Nonce::random(),
                jitter: rand::thread_rng().gen::<f64>(),
            };
            let before = self.state.name();
            let Transition { state, actions } = transition(&self.state, event, &ctx);
            if state.name() != before {
                debug!("Negotiation with {}: {} -> {}", self.remote.short(), before, state.name());
            }
            self.state = state;
            self.state_tx.send_replace(self.state.clone());

            for action in actions {
                if let Action::Restart = action {
                    pending.push(NegotiationEvent::Start);
                } else {
                    self.execute(action).await;
                }
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::SendOffer { negotiation } => {
                let candidates = self.deps.candidates.borrow().clone();
                self.signal(NegotiationMessage::Offer { negotiation, candidates }).await;
            }
            Action::SendAnswer { negotiation } => {
                let candidates = self.deps.candidates.borrow().clone();
                self.signal(NegotiationMessage::Answer { negotiation, candidates }).await;
            }
            Action::SendRelayOffer { negotiation, endpoint } => {
                self.signal(NegotiationMessage::RelayOffer { negotiation, endpoint }).await;
            }
            Action::SendTeardown { negotiation } => {
                self.signal(NegotiationMessage::Teardown { negotiation }).await;
            }
            Action::Probe { negotiation, candidates } => self.start_probe(negotiation, candidates),
            Action::CancelProbe => {
                if let Some(probe) = self.probe.take() {
                    probe.cancel();
                }
            }
            Action::AllocateRelay { negotiation } => self.start_allocation(negotiation),
            Action::ReleaseRelay => self.release_relay().await,
            Action::Arm { timer, after } => {
                let events = self.events_tx.clone();
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(after) => {
                            let _ = events.send(NegotiationEvent::TimerFired(timer)).await;
                        }
                    }
                });
            }
            Action::Restart => {}
            Action::Report(report) => {
                match &report {
                    Report::Established(path) => info!("Connected to {} via {:?}", self.remote.short(), path),
                    Report::Lost => info!("Lost path to {}", self.remote.short()),
                    Report::Failed { attempt, retry_in } => warn!(
                        "{}",
                        CoreError::negotiation(
                            self.remote,
                            format!("attempt {} failed, retrying in {:?}", attempt, retry_in)
                        )
                    ),
                }
                let update = NegotiatorUpdate {
                    peer: self.remote,
                    report,
                };
                if self.updates.send(update).await.is_err() {
                    trace!("Session manager is gone");
                }
            }
        }
    }

    async fn signal(&self, msg: NegotiationMessage) {
        let payload = match encode(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode negotiation message: {}", e);
                return;
            }
        };
        // Delivery failures are soft: timers and backoff drive the retry
        if let Err(e) = self.deps.signal.send(self.deps.local, self.remote, payload).await {
            debug!("Signal to {} failed: {}", self.remote.short(), e);
        }
    }

    fn start_probe(&mut self, negotiation: Nonce, candidates: Vec<Candidate>) {
        if let Some(previous) = self.probe.take() {
            previous.cancel();
        }
        let token = self.cancel.child_token();
        self.probe = Some(token.clone());

        let prober = self.deps.prober.clone();
        let events = self.events_tx.clone();
        let remote = self.remote;
        let timeout = self.deps.config.probe_timeout;
        let ordered = preference_order(&candidates);

        tokio::spawn(async move {
            let round = async {
                for candidate in &ordered {
                    trace!("Probing {:?} at {}", candidate.kind, candidate.addr);
                    match tokio::time::timeout(timeout, prober.probe(remote, candidate.addr, negotiation, timeout)).await {
                        Ok(Ok(addr)) => return Some(addr),
                        Ok(Err(e)) => trace!("Probe of {} failed: {}", candidate.addr, e),
                        Err(_) => trace!("Probe of {} timed out", candidate.addr),
                    }
                }
                None
            };

            let event = tokio::select! {
                _ = token.cancelled() => return,
                found = round => match found {
                    Some(addr) => NegotiationEvent::ProbeSucceeded { negotiation, addr },
                    None => NegotiationEvent::ProbeExhausted { negotiation },
                },
            };
            let _ = events.send(event).await;
        });
    }

    fn start_allocation(&self, negotiation: Nonce) {
        let events = self.events_tx.clone();
        let Some(relay) = self.deps.relay.clone() else {
            tokio::spawn(async move {
                let _ = events
                    .send(NegotiationEvent::RelayFailed {
                        negotiation,
                        reason: "no relay configured".into(),
                    })
                    .await;
            });
            return;
        };

        let remote = self.remote;
        let timeout = self.deps.config.allocation_timeout;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = tokio::time::timeout(timeout, relay.allocate(remote)) => outcome,
            };
            let event = match outcome {
                Ok(Ok(endpoint)) => NegotiationEvent::RelayAllocated { negotiation, endpoint },
                Ok(Err(e)) => NegotiationEvent::RelayFailed {
                    negotiation,
                    reason: e.to_string(),
                },
                Err(_) => NegotiationEvent::RelayFailed {
                    negotiation,
                    reason: "allocation timed out".into(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    async fn release_relay(&self) {
        if let Some(relay) = &self.deps.relay {
            match tokio::time::timeout(self.deps.config.allocation_timeout, relay.release(self.remote)).await {
                Ok(Ok(())) => trace!("Released relay slot towards {}", self.remote.short()),
                Ok(Err(e)) => debug!("Relay release towards {} failed: {}", self.remote.short(), e),
                Err(_) => debug!("Relay release towards {} timed out", self.remote.short()),
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.cancel();
        }
        if let Some(negotiation) = self.state.negotiation() {
            self.signal(NegotiationMessage::Teardown { negotiation }).await;
        }
        if self.state.holds_relay() {
            self.release_relay().await;
        }
        self.state = NegotiationState::Idle { attempt: 0 };
        self.state_tx.send_replace(self.state.clone());
    }
}
