//! Per-peer negotiation state machine.
//!
//! A `PeerLink` owns the connection handle for one remote participant plus
//! the two candidate queues that gate trickled ICE. Engine operations run in
//! spawned tasks; their completions come back through the session's event
//! channel and are applied here, on the session's serialization context, so
//! no transition ever races another.

use super::candidate_queue::CandidateQueue;
use super::glare;
use super::{EngineSignal, StampedEvent};
use crate::media::{AnswerConstraints, IceCandidate, MediaError, PeerConnection};
use crate::protocol::{ParticipantId, SdpKind, SdpPayload, SignalMessage};
use crate::signaling::{SignalingError, SignalingTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationState {
    Idle,
    OfferSent,
    /// Remote offer applied, local answer not yet on the wire.
    OfferReceived,
    AnswerSent,
    RemoteDescriptionSet,
    Closed,
}

/// Which engine operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationStage {
    CreateOffer,
    ApplyRemoteOffer,
    CreateAnswer,
    ApplyRemoteAnswer,
}

/// Completion of an asynchronous engine operation, re-entering the session
/// actor as an explicit event.
#[derive(Debug)]
pub(crate) enum NegotiationUpdate {
    OfferReady { remote_id: ParticipantId, sdp: String },
    RemoteOfferApplied { remote_id: ParticipantId },
    AnswerReady { remote_id: ParticipantId, sdp: String },
    RemoteAnswerApplied { remote_id: ParticipantId },
    Failed {
        remote_id: ParticipantId,
        stage: NegotiationStage,
        error: MediaError,
    },
}

/// Borrowed session state a link transition needs: identity for outgoing
/// messages, the signaling channel, and the stamped event channel for
/// spawned completions.
pub(crate) struct LinkContext<'a> {
    pub channel_id: &'a str,
    pub local_id: &'a ParticipantId,
    pub epoch: u64,
    pub events: &'a mpsc::UnboundedSender<StampedEvent>,
    pub signaling: &'a dyn SignalingTransport,
}

pub(crate) struct PeerLink {
    remote_id: ParticipantId,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    /// Set when an offer task is dispatched; an offer is requested at most
    /// once per link lifetime.
    offer_requested: bool,
    /// Set once the offer message is actually on the wire; gates outbound
    /// candidates.
    offer_sent: bool,
    remote_description_applied: bool,
    /// A set-remote-description task is in flight.
    applying_remote: bool,
    outbound: CandidateQueue,
    inbound: CandidateQueue,
    /// Sequential applier; everything pushed here reaches the connection in
    /// order, exactly once.
    apply_tx: mpsc::UnboundedSender<IceCandidate>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerLink {
    /// `forwarder` is the task routing engine candidate events into the
    /// session; the link owns it so teardown stops the flow.
    pub(crate) fn new(
        remote_id: ParticipantId,
        connection: Arc<dyn PeerConnection>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<IceCandidate>();
        let applier = tokio::spawn({
            let connection = connection.clone();
            let remote_id = remote_id.clone();
            async move {
                while let Some(candidate) = apply_rx.recv().await {
                    if let Err(err) = connection.add_ice_candidate(candidate).await {
                        tracing::warn!(
                            target = "mesh::session",
                            remote = %remote_id,
                            error = %err,
                            "remote ice candidate rejected"
                        );
                    }
                }
            }
        });
        Self {
            remote_id,
            connection,
            state: NegotiationState::Idle,
            offer_requested: false,
            offer_sent: false,
            remote_description_applied: false,
            applying_remote: false,
            outbound: CandidateQueue::default(),
            inbound: CandidateQueue::default(),
            apply_tx,
            tasks: vec![forwarder, applier],
        }
    }

    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    /// Kicks off offer creation. Idempotent: at most one offer is ever
    /// requested per link.
    pub(crate) fn start_offer(&mut self, ctx: &LinkContext<'_>) {
        if self.offer_requested || self.state == NegotiationState::Closed {
            return;
        }
        self.offer_requested = true;
        tracing::debug!(target = "mesh::session", remote = %self.remote_id, "creating offer");
        let connection = self.connection.clone();
        let remote_id = self.remote_id.clone();
        let events = ctx.events.clone();
        let epoch = ctx.epoch;
        self.tasks.push(tokio::spawn(async move {
            let result = async {
                let sdp = connection.create_offer().await?;
                connection
                    .set_local_description(SdpKind::Offer, sdp.clone())
                    .await?;
                Ok::<_, MediaError>(sdp)
            }
            .await;
            let update = match result {
                Ok(sdp) => NegotiationUpdate::OfferReady { remote_id, sdp },
                Err(error) => NegotiationUpdate::Failed {
                    remote_id,
                    stage: NegotiationStage::CreateOffer,
                    error,
                },
            };
            let _ = events.send(StampedEvent {
                epoch,
                signal: EngineSignal::Update(update),
            });
        }));
    }

    /// Offer created and local description set: put it on the wire, then
    /// release the candidates queued while it was pending.
    pub(crate) fn handle_offer_ready(
        &mut self,
        ctx: &LinkContext<'_>,
        sdp: String,
    ) -> Result<(), SignalingError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        ctx.signaling.send(SignalMessage::Offer {
            uid: ctx.local_id.clone(),
            to_uid: Some(self.remote_id.clone()),
            channel_id: Some(ctx.channel_id.to_string()),
            data: SdpPayload {
                sdp,
                kind: SdpKind::Offer,
            },
        })?;
        self.offer_sent = true;
        if self.state == NegotiationState::Idle {
            self.state = NegotiationState::OfferSent;
        }
        tracing::info!(target = "mesh::session", remote = %self.remote_id, "offer sent");
        self.flush_outbound(ctx)
    }

    /// A remote offer arrived over signaling.
    pub(crate) fn handle_remote_offer(&mut self, ctx: &LinkContext<'_>, sdp: String) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.offer_requested && glare::should_initiate_offer(ctx.local_id, &self.remote_id) {
            // Glare is already resolved in our favor; a counter-offer from
            // the higher-sorted peer violates the protocol.
            tracing::error!(
                target = "mesh::session",
                remote = %self.remote_id,
                "offer received from higher-sorted peer after local offer; dropping"
            );
            return;
        }
        if self.applying_remote {
            tracing::debug!(
                target = "mesh::session",
                remote = %self.remote_id,
                "remote description already being applied; dropping duplicate offer"
            );
            return;
        }
        self.applying_remote = true;
        self.spawn_apply_remote(ctx, SdpKind::Offer, sdp, NegotiationStage::ApplyRemoteOffer);
    }

    /// Remote offer applied: release buffered remote candidates and request
    /// the local answer (audio-only reception).
    pub(crate) fn handle_remote_offer_applied(&mut self, ctx: &LinkContext<'_>) {
        self.applying_remote = false;
        if self.state == NegotiationState::Closed {
            return;
        }
        self.remote_description_applied = true;
        self.state = NegotiationState::OfferReceived;
        self.flush_inbound();
        let connection = self.connection.clone();
        let remote_id = self.remote_id.clone();
        let events = ctx.events.clone();
        let epoch = ctx.epoch;
        self.tasks.push(tokio::spawn(async move {
            let result = async {
                let sdp = connection.create_answer(AnswerConstraints::default()).await?;
                connection
                    .set_local_description(SdpKind::Answer, sdp.clone())
                    .await?;
                Ok::<_, MediaError>(sdp)
            }
            .await;
            let update = match result {
                Ok(sdp) => NegotiationUpdate::AnswerReady { remote_id, sdp },
                Err(error) => NegotiationUpdate::Failed {
                    remote_id,
                    stage: NegotiationStage::CreateAnswer,
                    error,
                },
            };
            let _ = events.send(StampedEvent {
                epoch,
                signal: EngineSignal::Update(update),
            });
        }));
    }

    pub(crate) fn handle_answer_ready(
        &mut self,
        ctx: &LinkContext<'_>,
        sdp: String,
    ) -> Result<(), SignalingError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        self.state = NegotiationState::AnswerSent;
        ctx.signaling.send(SignalMessage::Answer {
            uid: ctx.local_id.clone(),
            to_uid: Some(self.remote_id.clone()),
            channel_id: Some(ctx.channel_id.to_string()),
            data: SdpPayload {
                sdp,
                kind: SdpKind::Answer,
            },
        })?;
        self.state = NegotiationState::RemoteDescriptionSet;
        tracing::info!(target = "mesh::session", remote = %self.remote_id, "answer sent");
        self.flush_outbound(ctx)
    }

    /// A remote answer arrived over signaling.
    pub(crate) fn handle_remote_answer(&mut self, ctx: &LinkContext<'_>, sdp: String) {
        if self.state != NegotiationState::OfferSent {
            tracing::warn!(
                target = "mesh::session",
                remote = %self.remote_id,
                state = ?self.state,
                "answer received in unexpected state; dropping"
            );
            return;
        }
        if self.applying_remote {
            return;
        }
        self.applying_remote = true;
        self.spawn_apply_remote(ctx, SdpKind::Answer, sdp, NegotiationStage::ApplyRemoteAnswer);
    }

    pub(crate) fn handle_remote_answer_applied(&mut self) {
        self.applying_remote = false;
        if self.state == NegotiationState::Closed {
            return;
        }
        self.remote_description_applied = true;
        self.flush_inbound();
        self.state = NegotiationState::RemoteDescriptionSet;
        tracing::info!(target = "mesh::session", remote = %self.remote_id, "negotiation complete");
    }

    /// Leaves the link in its last good state; pending guards are reset so a
    /// retried message can still succeed. No automatic retry.
    pub(crate) fn handle_failure(&mut self, stage: NegotiationStage, error: &MediaError) {
        tracing::warn!(
            target = "mesh::session",
            remote = %self.remote_id,
            stage = ?stage,
            error = %error,
            "negotiation step failed"
        );
        match stage {
            NegotiationStage::CreateOffer => self.offer_requested = false,
            NegotiationStage::ApplyRemoteOffer | NegotiationStage::ApplyRemoteAnswer => {
                self.applying_remote = false;
            }
            NegotiationStage::CreateAnswer => {}
        }
    }

    /// Candidate received from the remote peer.
    pub(crate) fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.remote_description_applied {
            let _ = self.apply_tx.send(candidate);
        } else {
            self.inbound.enqueue(candidate);
        }
    }

    /// Candidate gathered locally by the engine.
    pub(crate) fn handle_local_candidate(
        &mut self,
        ctx: &LinkContext<'_>,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        if self.offer_sent || self.remote_description_applied {
            self.send_candidate(ctx, candidate)
        } else {
            self.outbound.enqueue(candidate);
            Ok(())
        }
    }

    /// Terminal. Queued candidates are discarded and the connection handle
    /// closed; a re-appearing participant gets a fresh link.
    pub(crate) fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.outbound.drain();
        self.inbound.drain();
        let connection = self.connection.clone();
        let remote_id = self.remote_id.clone();
        tokio::spawn(async move {
            connection.close().await;
            tracing::debug!(target = "mesh::session", remote = %remote_id, "connection closed");
        });
    }

    fn spawn_apply_remote(
        &mut self,
        ctx: &LinkContext<'_>,
        kind: SdpKind,
        sdp: String,
        stage: NegotiationStage,
    ) {
        let connection = self.connection.clone();
        let remote_id = self.remote_id.clone();
        let events = ctx.events.clone();
        let epoch = ctx.epoch;
        self.tasks.push(tokio::spawn(async move {
            let update = match connection.set_remote_description(kind, sdp).await {
                Ok(()) => match stage {
                    NegotiationStage::ApplyRemoteOffer => {
                        NegotiationUpdate::RemoteOfferApplied { remote_id }
                    }
                    _ => NegotiationUpdate::RemoteAnswerApplied { remote_id },
                },
                Err(error) => NegotiationUpdate::Failed {
                    remote_id,
                    stage,
                    error,
                },
            };
            let _ = events.send(StampedEvent {
                epoch,
                signal: EngineSignal::Update(update),
            });
        }));
    }

    fn flush_outbound(&mut self, ctx: &LinkContext<'_>) -> Result<(), SignalingError> {
        let mut pending = self.outbound.drain().into_iter();
        while let Some(candidate) = pending.next() {
            if let Err(err) = self.send_candidate(ctx, candidate) {
                // The rest of the batch is undeliverable on a closed channel.
                tracing::debug!(
                    target = "mesh::session",
                    remote = %self.remote_id,
                    discarded = pending.len() + 1,
                    "discarding buffered candidates after send failure"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn flush_inbound(&mut self) {
        for candidate in self.inbound.drain() {
            let _ = self.apply_tx.send(candidate);
        }
    }

    fn send_candidate(
        &self,
        ctx: &LinkContext<'_>,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        ctx.signaling.send(SignalMessage::IceCandidate {
            uid: ctx.local_id.clone(),
            to_uid: Some(self.remote_id.clone()),
            channel_id: Some(ctx.channel_id.to_string()),
            data: candidate.into(),
        })
    }
}
