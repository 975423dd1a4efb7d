use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use signal_link::{Inbound, SignalLink};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NegotiatorConfig;
use crate::message::{IceCandidate, SessionDescription, SignalMessage};
use crate::peer::{Connectivity, PeerConnection, PeerEvent, PeerFactory};
use crate::{CallError, CallResult, CallRole, CallState, CallStatus, TerminationReason};

/// What happened to one remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Queued until the remote description is applied.
    Buffered,
    /// Malformed or duplicate; logged and dropped.
    Rejected,
    /// The session is already terminated.
    Ignored,
}

/// Result of dispatching one inbound signal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// An offer for an idle session; hand it to [`CallSession::accept_offer`]
    /// to answer the call.
    IncomingOffer(SessionDescription),
    /// Offer rejected because a negotiation is already in progress.
    Busy,
    /// The remote answer was applied.
    AnswerApplied,
    /// We gave up our own offer and answered the remote one.
    Yielded,
    Candidate(CandidateOutcome),
    /// The remote end hung up.
    HungUp,
    /// Valid message with no meaning in the current state.
    Ignored,
    /// Applying the message failed; the session is terminated.
    Failed,
    Malformed,
}

/// One voice call negotiated over a signaling link.
///
/// Handles are cheap to clone and share one session. Every asynchronous step
/// re-checks the session generation when it resumes, so steps that were
/// overtaken by [`end`](CallSession::end) or a glare hand-over never mutate
/// state.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    config: NegotiatorConfig,
    link: Arc<dyn SignalLink>,
    factory: Arc<dyn PeerFactory>,
    core: Mutex<SessionCore>,
    /// Serializes candidate application so a flush of buffered candidates is
    /// never overtaken by one that arrives mid-flush.
    apply_gate: AsyncMutex<()>,
    status_tx: watch::Sender<CallStatus>,
}

struct SessionCore {
    state: CallState,
    role: Option<CallRole>,
    reason: Option<TerminationReason>,
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    remote_description_in_flight: bool,
    applied: HashSet<(String, Option<String>, Option<u16>)>,
}

impl SessionCore {
    fn status(&self) -> CallStatus {
        CallStatus {
            state: self.state,
            role: self.role,
            reason: self.reason.clone(),
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.state != CallState::Terminated
    }
}

impl CallSession {
    pub fn new(
        config: NegotiatorConfig,
        link: Arc<dyn SignalLink>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let (status_tx, _) = watch::channel(CallStatus::default());
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                config,
                link,
                factory,
                core: Mutex::new(SessionCore {
                    state: CallState::Idle,
                    role: None,
                    reason: None,
                    generation: 0,
                    peer: None,
                    pending_candidates: VecDeque::new(),
                    remote_description_set: false,
                    remote_description_in_flight: false,
                    applied: HashSet::new(),
                }),
                apply_gate: AsyncMutex::new(()),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> CallStatus {
        self.inner.core.lock().status()
    }

    pub fn state(&self) -> CallState {
        self.inner.core.lock().state
    }

    pub fn role(&self) -> Option<CallRole> {
        self.inner.core.lock().role
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn pending_candidates(&self) -> usize {
        self.inner.core.lock().pending_candidates.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.inner.core.lock().remote_description_set
    }

    /// Places the call: acquires the local peer, sends our offer and waits
    /// for the answer to arrive through [`handle_message`].
    ///
    /// [`handle_message`]: CallSession::handle_message
    pub async fn start(&self) -> CallResult<()> {
        let generation = self.inner.begin("start", CallRole::Initiator)?;
        info!(target = "call", session = %self.inner.id, "placing call");

        let peer = self.inner.acquire_peer(generation).await?;
        let offer = self
            .inner
            .checked(generation, peer.create_offer().await)
            .await?;
        self.inner
            .checked(generation, peer.set_local_description(offer.clone()).await)
            .await?;
        self.inner
            .send_or_fail(
                generation,
                &SignalMessage::Offer {
                    sdp: offer.sdp,
                    peer_id: self.inner.config.local_peer_id.clone(),
                },
            )
            .await?;
        debug!(target = "call", session = %self.inner.id, "offer sent");
        Ok(())
    }

    /// Answers an incoming call.
    pub async fn accept_offer(&self, offer: SessionDescription) -> CallResult<()> {
        let generation = self.inner.begin("accept an offer", CallRole::Responder)?;
        info!(target = "call", session = %self.inner.id, "answering call");
        self.inner.respond(generation, offer).await
    }

    /// Applies a remote candidate now, or buffers it until the remote
    /// description is in place.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> CandidateOutcome {
        self.inner.add_remote_candidate(candidate).await
    }

    /// Parses and dispatches one inbound link frame.
    pub async fn handle_message(&self, text: &str) -> Dispatch {
        match SignalMessage::parse(text) {
            Ok(message) => self.dispatch(message).await,
            Err(err) => {
                warn!(
                    target = "call",
                    session = %self.inner.id,
                    error = %err,
                    "dropping malformed signal message"
                );
                Dispatch::Malformed
            }
        }
    }

    pub async fn dispatch(&self, message: SignalMessage) -> Dispatch {
        debug!(target = "call", session = %self.inner.id, kind = message.kind(), "signal received");
        match message {
            SignalMessage::Offer { sdp, peer_id } => {
                self.inner
                    .on_offer(SessionDescription::offer(sdp), peer_id)
                    .await
            }
            SignalMessage::Answer { sdp } => {
                self.inner.on_answer(SessionDescription::answer(sdp)).await
            }
            SignalMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment,
                };
                Dispatch::Candidate(self.inner.add_remote_candidate(candidate).await)
            }
            SignalMessage::Hangup { reason } => {
                info!(
                    target = "call",
                    session = %self.inner.id,
                    reason = reason.as_deref().unwrap_or("none"),
                    "remote hung up"
                );
                if self
                    .inner
                    .terminate(None, TerminationReason::RemoteHangup, false)
                    .await
                {
                    Dispatch::HungUp
                } else {
                    Dispatch::Ignored
                }
            }
        }
    }

    /// Hangs up: releases the peer, tells the remote end if the link is still
    /// open and moves to `Terminated`. Later calls do nothing.
    pub async fn end(&self) {
        self.inner
            .terminate(None, TerminationReason::LocalHangup, true)
            .await;
    }

    /// Drives [`handle_message`](CallSession::handle_message) from the
    /// link's inbound frames, one at a time and in order. Offers for an idle
    /// session are forwarded on the returned channel for the UI to accept.
    /// The pump stops when the link closes, the session terminates or every
    /// handle to the session is dropped.
    pub fn attach(&self, mut incoming: Inbound) -> mpsc::UnboundedReceiver<SessionDescription> {
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = CallSession { inner };
                if let Dispatch::IncomingOffer(offer) = session.handle_message(&text).await {
                    if offers_tx.send(offer).is_err() {
                        warn!(
                            target = "call",
                            session = %session.id(),
                            "incoming offer dropped; nobody is listening for calls"
                        );
                    }
                }
                if session.state() == CallState::Terminated {
                    return;
                }
            }
            debug!(target = "call", "signaling link inbound closed");
        });
        offers_rx
    }
}

impl SessionInner {
    fn publish(&self, core: &SessionCore) {
        let status = core.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn is_live(&self, generation: u64) -> bool {
        self.core.lock().is_live(generation)
    }

    /// Moves an idle session into negotiation with `role`.
    fn begin(&self, op: &'static str, role: CallRole) -> CallResult<u64> {
        let mut core = self.core.lock();
        if core.state != CallState::Idle {
            return Err(CallError::InvalidState {
                op,
                state: core.state,
            });
        }
        core.role = Some(role);
        core.state = CallState::Negotiating;
        self.publish(&core);
        Ok(core.generation)
    }

    fn advance(&self, generation: u64, next: CallState) -> bool {
        let mut core = self.core.lock();
        if !core.is_live(generation) || !core.state.can_advance_to(next) {
            return false;
        }
        core.state = next;
        self.publish(&core);
        true
    }

    /// Passes `result` through while the session is still live for
    /// `generation`; a failure terminates the session.
    async fn checked<T>(
        self: &Arc<Self>,
        generation: u64,
        result: Result<T, crate::PeerError>,
    ) -> CallResult<T> {
        match result {
            Ok(value) if self.is_live(generation) => Ok(value),
            Ok(_) => Err(CallError::Cancelled),
            Err(err) => Err(self.fail(generation, CallError::Negotiation(err)).await),
        }
    }

    async fn fail(self: &Arc<Self>, generation: u64, error: CallError) -> CallError {
        warn!(
            target = "call",
            session = %self.id,
            error = %error,
            "call negotiation failed"
        );
        let reason = TerminationReason::Failed(error.to_string());
        if self.terminate(Some(generation), reason, true).await {
            error
        } else {
            CallError::Cancelled
        }
    }

    fn send(&self, message: &SignalMessage) -> CallResult<()> {
        let text = message.to_json()?;
        self.link.send(&text)?;
        Ok(())
    }

    async fn send_or_fail(self: &Arc<Self>, generation: u64, message: &SignalMessage) -> CallResult<()> {
        if !self.is_live(generation) {
            return Err(CallError::Cancelled);
        }
        match self.send(message) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(generation, err).await),
        }
    }

    async fn acquire_peer(
        self: &Arc<Self>,
        generation: u64,
    ) -> CallResult<Arc<dyn PeerConnection>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = match self.factory.acquire(events_tx).await {
            Ok(peer) => peer,
            Err(err) => return Err(self.fail(generation, CallError::Negotiation(err)).await),
        };

        let stored = {
            let mut core = self.core.lock();
            if core.is_live(generation) {
                core.peer = Some(Arc::clone(&peer));
                true
            } else {
                false
            }
        };
        if !stored {
            // Torn down while acquiring; nobody else will release this one.
            if let Err(err) = peer.close().await {
                warn!(target = "call", session = %self.id, error = %err, "failed to release stale peer");
            }
            return Err(CallError::Cancelled);
        }

        tokio::spawn(pump_peer_events(Arc::downgrade(self), generation, events_rx));
        Ok(peer)
    }

    async fn respond(self: &Arc<Self>, generation: u64, offer: SessionDescription) -> CallResult<()> {
        let peer = self.acquire_peer(generation).await?;
        self.core.lock().remote_description_in_flight = true;
        self.checked(generation, peer.set_remote_description(offer).await)
            .await?;
        self.flush_pending(generation, &peer).await?;
        let answer = self
            .checked(generation, peer.create_answer().await)
            .await?;
        self.checked(generation, peer.set_local_description(answer.clone()).await)
            .await?;
        self.send_or_fail(generation, &SignalMessage::Answer { sdp: answer.sdp })
            .await?;
        if self.advance(generation, CallState::Connected) {
            info!(target = "call", session = %self.id, "call connected as responder");
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    async fn on_offer(self: &Arc<Self>, offer: SessionDescription, remote_peer_id: Option<String>) -> Dispatch {
        let (state, role) = {
            let core = self.core.lock();
            (core.state, core.role)
        };
        match (state, role) {
            (CallState::Idle, _) => Dispatch::IncomingOffer(offer),
            (CallState::Terminated, _) => Dispatch::Ignored,
            (CallState::Negotiating, Some(CallRole::Initiator))
                if self.config.yields_to(remote_peer_id.as_deref()) =>
            {
                self.yield_to_remote(offer).await
            }
            (CallState::Negotiating, Some(CallRole::Initiator)) => {
                warn!(
                    target = "call",
                    session = %self.id,
                    remote_peer = remote_peer_id.as_deref().unwrap_or("unknown"),
                    "offer received while our own offer is pending; busy"
                );
                Dispatch::Busy
            }
            _ => {
                debug!(target = "call", session = %self.id, state = ?state, "offer during active call; busy");
                Dispatch::Busy
            }
        }
    }

    /// Glare hand-over: drop our offer and answer theirs. Buffered candidates
    /// belong to the remote offer and are kept.
    async fn yield_to_remote(self: &Arc<Self>, offer: SessionDescription) -> Dispatch {
        let (old_peer, generation) = {
            let mut core = self.core.lock();
            if core.state != CallState::Negotiating || core.role != Some(CallRole::Initiator) {
                return Dispatch::Busy;
            }
            core.generation += 1;
            core.role = Some(CallRole::Responder);
            core.remote_description_set = false;
            core.remote_description_in_flight = false;
            core.applied.clear();
            self.publish(&core);
            (core.peer.take(), core.generation)
        };
        info!(target = "call", session = %self.id, "glare: yielding to remote offer");
        if let Some(peer) = old_peer {
            if let Err(err) = peer.close().await {
                warn!(target = "call", session = %self.id, error = %err, "failed to close abandoned peer");
            }
        }
        match self.respond(generation, offer).await {
            Ok(()) => Dispatch::Yielded,
            Err(CallError::Cancelled) => Dispatch::Ignored,
            Err(_) => Dispatch::Failed,
        }
    }

    async fn on_answer(self: &Arc<Self>, answer: SessionDescription) -> Dispatch {
        let (peer, generation) = {
            let mut core = self.core.lock();
            let expecting = core.state == CallState::Negotiating
                && core.role == Some(CallRole::Initiator)
                && !core.remote_description_set
                && !core.remote_description_in_flight;
            match (expecting, core.peer.clone()) {
                (true, Some(peer)) => {
                    core.remote_description_in_flight = true;
                    (peer, core.generation)
                }
                _ => {
                    debug!(target = "call", session = %self.id, state = ?core.state, "unexpected answer ignored");
                    return Dispatch::Ignored;
                }
            }
        };

        match self
            .checked(generation, peer.set_remote_description(answer).await)
            .await
        {
            Ok(()) => {}
            Err(CallError::Cancelled) => return Dispatch::Ignored,
            Err(_) => return Dispatch::Failed,
        }
        if self.flush_pending(generation, &peer).await.is_err() {
            return Dispatch::Ignored;
        }
        if self.advance(generation, CallState::Connected) {
            info!(target = "call", session = %self.id, "call connected as initiator");
            Dispatch::AnswerApplied
        } else {
            Dispatch::Ignored
        }
    }

    /// Marks the remote description applied and drains the candidate buffer
    /// into the peer in arrival order.
    async fn flush_pending(
        &self,
        generation: u64,
        peer: &Arc<dyn PeerConnection>,
    ) -> CallResult<()> {
        let _gate = self.apply_gate.lock().await;
        let drained: Vec<IceCandidate> = {
            let mut core = self.core.lock();
            if !core.is_live(generation) {
                return Err(CallError::Cancelled);
            }
            core.remote_description_set = true;
            core.remote_description_in_flight = false;
            core.pending_candidates.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(
                target = "call",
                session = %self.id,
                count = drained.len(),
                "applying buffered candidates"
            );
        }
        for candidate in drained {
            if !self.is_live(generation) {
                return Err(CallError::Cancelled);
            }
            self.apply_candidate(peer, candidate).await;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> CandidateOutcome {
        let (peer, generation) = {
            let mut core = self.core.lock();
            if core.state == CallState::Terminated {
                return CandidateOutcome::Ignored;
            }
            if !core.remote_description_set {
                core.pending_candidates.push_back(candidate);
                debug!(
                    target = "call",
                    session = %self.id,
                    pending = core.pending_candidates.len(),
                    "remote candidate buffered"
                );
                return CandidateOutcome::Buffered;
            }
            match core.peer.clone() {
                Some(peer) => (peer, core.generation),
                None => return CandidateOutcome::Ignored,
            }
        };

        let _gate = self.apply_gate.lock().await;
        if !self.is_live(generation) {
            return CandidateOutcome::Ignored;
        }
        self.apply_candidate(&peer, candidate).await
    }

    /// Caller must hold `apply_gate`.
    async fn apply_candidate(
        &self,
        peer: &Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    ) -> CandidateOutcome {
        if !self.core.lock().applied.insert(candidate.dedupe_key()) {
            warn!(
                target = "call",
                session = %self.id,
                candidate = %candidate.candidate,
                "duplicate remote candidate ignored"
            );
            return CandidateOutcome::Rejected;
        }
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(err) => {
                warn!(
                    target = "call",
                    session = %self.id,
                    error = %err,
                    "remote candidate rejected"
                );
                CandidateOutcome::Rejected
            }
        }
    }

    /// Moves to `Terminated` and releases the peer. Returns `false` when the
    /// session was already terminated or `expected` no longer matches the
    /// current generation; nothing is touched in that case.
    async fn terminate(
        &self,
        expected: Option<u64>,
        reason: TerminationReason,
        notify_remote: bool,
    ) -> bool {
        let peer = {
            let mut core = self.core.lock();
            if core.state == CallState::Terminated {
                return false;
            }
            if expected.is_some_and(|generation| generation != core.generation) {
                return false;
            }
            core.generation += 1;
            core.state = CallState::Terminated;
            core.reason = Some(reason.clone());
            core.pending_candidates.clear();
            core.remote_description_in_flight = false;
            self.publish(&core);
            core.peer.take()
        };

        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(target = "call", session = %self.id, error = %err, "failed to close peer");
            }
        }
        if notify_remote && self.link.is_open() {
            let reason_text = match &reason {
                TerminationReason::LocalHangup => None,
                _ => Some("failed".to_string()),
            };
            if let Err(err) = self.send(&SignalMessage::Hangup { reason: reason_text }) {
                warn!(target = "call", session = %self.id, error = %err, "failed to send hangup");
            }
        }
        info!(target = "call", session = %self.id, reason = ?reason, "call terminated");
        true
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if core.state == CallState::Terminated {
            return;
        }
        let peer = core.peer.take();
        if self.link.is_open() {
            if let Err(err) = self.send(&SignalMessage::Hangup { reason: None }) {
                warn!(target = "call", session = %self.id, error = %err, "failed to send hangup on drop");
            }
        }
        if let Some(peer) = peer {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(target = "call", session = %self.id, "no runtime to release peer on drop");
                return;
            };
            let session = self.id.clone();
            runtime.spawn(async move {
                if let Err(err) = peer.close().await {
                    warn!(target = "call", session = %session, error = %err, "failed to close peer on drop");
                }
            });
        }
    }
}

async fn pump_peer_events(
    inner: Weak<SessionInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.is_live(generation) {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(err) = inner.send(&SignalMessage::candidate(candidate)) {
                    warn!(
                        target = "call",
                        session = %inner.id,
                        error = %err,
                        "failed to send local candidate"
                    );
                }
            }
            PeerEvent::Connectivity(Connectivity::Failed) => {
                warn!(target = "call", session = %inner.id, "peer connectivity failed");
                inner
                    .terminate(Some(generation), TerminationReason::ConnectionFailed, true)
                    .await;
                return;
            }
            PeerEvent::Connectivity(state) => {
                debug!(target = "call", session = %inner.id, state = ?state, "peer connectivity");
            }
        }
    }
}
