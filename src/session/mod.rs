//! Channel session: owns the signaling transport and one [`PeerLink`] per
//! remote participant.
//!
//! Everything that can touch negotiation state funnels into a single actor
//! task: public commands, inbound signaling messages, engine candidate
//! events, and the completions of asynchronous engine operations. Spawned
//! engine tasks stamp their completions with the session epoch; anything
//! arriving after a `leave` (or a re-`join`) carries a stale epoch and is
//! discarded, so teardown never waits on an in-flight operation.

mod candidate_queue;
mod glare;
mod peer_link;
mod router;

use crate::config::RtcConfig;
use crate::media::{IceCandidate, MediaEngine, MediaError};
use crate::protocol::{ParticipantId, SignalMessage};
use crate::signaling::{SignalingConnector, SignalingError, SignalingTransport};
use peer_link::{LinkContext, NegotiationState, NegotiationUpdate, PeerLink};
use router::SignalEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("session task stopped")]
    Stopped,
}

/// Notifications surfaced to the consuming application.
#[derive(Debug)]
pub enum MeshEvent {
    ParticipantJoined { id: ParticipantId },
    ParticipantLeft { id: ParticipantId, reason: String },
    /// The link to `id` has both descriptions in place; media can flow.
    NegotiationComplete { id: ParticipantId },
    NegotiationFailed { id: ParticipantId, error: MediaError },
    /// The signaling channel dropped. No reconnect is attempted here; that
    /// policy belongs to the consumer.
    SignalingClosed,
    SignalingError { message: String },
}

enum SessionCommand {
    Join {
        channel_id: String,
        local_id: ParticipantId,
        credential: String,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        done: oneshot::Sender<()>,
    },
    RenewCredential {
        credential: String,
    },
}

/// Event from an engine task or candidate forwarder, stamped with the epoch
/// it was spawned under.
pub(crate) struct StampedEvent {
    pub epoch: u64,
    pub signal: EngineSignal,
}

pub(crate) enum EngineSignal {
    Candidate {
        remote_id: ParticipantId,
        candidate: IceCandidate,
    },
    Update(NegotiationUpdate),
}

/// Handle to a session actor. Cheap to keep around; dropping it stops the
/// actor and everything it owns.
pub struct MeshSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl MeshSession {
    /// Creates the session actor. Events for the application come out of the
    /// returned receiver.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        connector: Arc<dyn SignalingConnector>,
        config: RtcConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_out, events_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            engine,
            connector,
            base_config: config,
            events_out,
            commands: command_rx,
            engine_events: engine_rx,
            engine_tx,
            epoch: 0,
            joined: None,
        };
        let task = tokio::spawn(actor.run());
        (Self { commands, task }, events_rx)
    }

    /// Joins `channel_id` as `local_id`, opening the signaling transport and
    /// announcing presence. Joining while already joined leaves the previous
    /// channel first.
    pub async fn join(
        &self,
        channel_id: impl Into<String>,
        local_id: impl Into<ParticipantId>,
        credential: impl Into<String>,
    ) -> Result<(), SessionError> {
        let (done, ack) = oneshot::channel();
        self.commands
            .send(SessionCommand::Join {
                channel_id: channel_id.into(),
                local_id: local_id.into(),
                credential: credential.into(),
                done,
            })
            .map_err(|_| SessionError::Stopped)?;
        ack.await.map_err(|_| SessionError::Stopped)?
    }

    /// Closes every peer link and the signaling transport. Safe from any
    /// state; a no-op when not joined.
    pub async fn leave(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(SessionCommand::Leave { done }).is_ok() {
            let _ = ack.await;
        }
    }

    /// Supplies a renewed relay credential. Applies to future connectivity
    /// attempts only; established links are not renegotiated.
    pub fn renew_credential(&self, credential: impl Into<String>) {
        let _ = self.commands.send(SessionCommand::RenewCredential {
            credential: credential.into(),
        });
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct JoinedChannel {
    channel_id: String,
    local_id: ParticipantId,
    credential: String,
    transport: Box<dyn SignalingTransport>,
    transport_open: bool,
    links: HashMap<ParticipantId, PeerLink>,
    membership: HashSet<ParticipantId>,
}

struct SessionActor {
    engine: Arc<dyn MediaEngine>,
    connector: Arc<dyn SignalingConnector>,
    base_config: RtcConfig,
    events_out: mpsc::UnboundedSender<MeshEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    engine_events: mpsc::UnboundedReceiver<StampedEvent>,
    engine_tx: mpsc::UnboundedSender<StampedEvent>,
    epoch: u64,
    joined: Option<JoinedChannel>,
}

enum Step {
    Command(Option<SessionCommand>),
    Engine(StampedEvent),
    Wire(Option<SignalMessage>),
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            let step = match self.joined.as_mut() {
                Some(channel) if channel.transport_open => tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    Some(event) = self.engine_events.recv() => Step::Engine(event),
                    message = channel.transport.recv() => Step::Wire(message),
                },
                _ => tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    Some(event) = self.engine_events.recv() => Step::Engine(event),
                },
            };
            match step {
                Step::Command(None) => {
                    // All handles gone; tear down quietly.
                    self.leave_channel(false).await;
                    return;
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Engine(event) => self.handle_engine_event(event),
                Step::Wire(None) => {
                    if let Some(channel) = self.joined.as_mut() {
                        channel.transport_open = false;
                    }
                    tracing::warn!(target = "mesh::session", "signaling transport closed");
                    let _ = self.events_out.send(MeshEvent::SignalingClosed);
                }
                Step::Wire(Some(message)) => self.handle_wire_message(message).await,
            }
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                channel_id,
                local_id,
                credential,
                done,
            } => {
                // Re-join resets all transient state.
                self.leave_channel(true).await;
                self.epoch += 1;
                let result = self.open_channel(channel_id, local_id, credential).await;
                let _ = done.send(result);
            }
            SessionCommand::Leave { done } => {
                self.leave_channel(true).await;
                let _ = done.send(());
            }
            SessionCommand::RenewCredential { credential } => {
                self.renew_credential(credential);
            }
        }
    }

    async fn open_channel(
        &mut self,
        channel_id: String,
        local_id: ParticipantId,
        credential: String,
    ) -> Result<(), SessionError> {
        let transport = self.connector.connect().await?;
        transport.send(SignalMessage::Join {
            channel_id: channel_id.clone(),
            uid: local_id.clone(),
        })?;
        tracing::info!(
            target = "mesh::session",
            channel = %channel_id,
            uid = %local_id,
            "joined channel"
        );
        self.joined = Some(JoinedChannel {
            channel_id,
            local_id,
            credential,
            transport,
            transport_open: true,
            links: HashMap::new(),
            membership: HashSet::new(),
        });
        Ok(())
    }

    async fn leave_channel(&mut self, announce: bool) {
        let Some(mut channel) = self.joined.take() else {
            return;
        };
        for (_, mut link) in channel.links.drain() {
            link.close();
        }
        if announce && channel.transport_open {
            let leave = SignalMessage::Leave {
                channel_id: channel.channel_id.clone(),
                uid: channel.local_id.clone(),
            };
            if let Err(err) = channel.transport.send(leave) {
                tracing::debug!(target = "mesh::session", error = %err, "leave announce failed");
            }
        }
        channel.transport.close().await;
        // In-flight completions from this channel now carry a stale epoch.
        self.epoch += 1;
        tracing::info!(
            target = "mesh::session",
            channel = %channel.channel_id,
            "left channel"
        );
    }

    fn renew_credential(&mut self, credential: String) {
        let Some(channel) = self.joined.as_mut() else {
            tracing::debug!(target = "mesh::session", "credential renewal while not joined; ignoring");
            return;
        };
        if credential.is_empty() {
            tracing::warn!(target = "mesh::session", "empty credential supplied; ignoring");
            return;
        }
        channel.credential = credential;
        for link in channel.links.values() {
            link.connection().update_ice_credential(&channel.credential);
        }
        tracing::info!(
            target = "mesh::session",
            links = channel.links.len(),
            "relay credential renewed for future connectivity attempts"
        );
    }

    async fn handle_wire_message(&mut self, message: SignalMessage) {
        let Some(channel) = self.joined.as_ref() else {
            return;
        };
        let Some(event) = router::route(&channel.local_id, message) else {
            return;
        };
        match event {
            SignalEvent::MembershipSnapshot(users) => {
                for user in users {
                    let Some(channel) = self.joined.as_ref() else {
                        return;
                    };
                    if user == channel.local_id {
                        continue;
                    }
                    self.connect_to(user).await;
                }
            }
            SignalEvent::ParticipantJoined(id) => {
                let already_known = self
                    .joined
                    .as_ref()
                    .is_some_and(|channel| channel.membership.contains(&id));
                if !already_known {
                    let _ = self
                        .events_out
                        .send(MeshEvent::ParticipantJoined { id: id.clone() });
                }
                self.connect_to(id).await;
            }
            SignalEvent::ParticipantLeft(id, reason) => {
                // Idempotent: repeated departures produce one event.
                if self.drop_link(&id) {
                    let _ = self.events_out.send(MeshEvent::ParticipantLeft { id, reason });
                }
            }
            SignalEvent::OfferReceived { from, sdp } => {
                if self.ensure_link(&from).await {
                    self.with_link(&from, |link, ctx| {
                        link.handle_remote_offer(ctx, sdp);
                        Ok(())
                    });
                }
            }
            SignalEvent::AnswerReceived { from, sdp } => {
                if self.ensure_link(&from).await {
                    self.with_link(&from, |link, ctx| {
                        link.handle_remote_answer(ctx, sdp);
                        Ok(())
                    });
                }
            }
            SignalEvent::CandidateReceived { from, candidate } => {
                if self.ensure_link(&from).await {
                    self.with_link(&from, |link, _ctx| {
                        link.handle_remote_candidate(candidate);
                        Ok(())
                    });
                }
            }
        }
    }

    fn handle_engine_event(&mut self, event: StampedEvent) {
        if event.epoch != self.epoch {
            tracing::trace!(target = "mesh::session", "discarding stale engine event");
            return;
        }
        match event.signal {
            EngineSignal::Candidate {
                remote_id,
                candidate,
            } => {
                self.with_link(&remote_id, |link, ctx| {
                    link.handle_local_candidate(ctx, candidate)
                });
            }
            EngineSignal::Update(update) => self.handle_negotiation_update(update),
        }
    }

    fn handle_negotiation_update(&mut self, update: NegotiationUpdate) {
        match update {
            NegotiationUpdate::OfferReady { remote_id, sdp } => {
                self.with_link(&remote_id, |link, ctx| link.handle_offer_ready(ctx, sdp));
            }
            NegotiationUpdate::RemoteOfferApplied { remote_id } => {
                self.with_link(&remote_id, |link, ctx| {
                    link.handle_remote_offer_applied(ctx);
                    Ok(())
                });
            }
            NegotiationUpdate::AnswerReady { remote_id, sdp } => {
                self.with_link(&remote_id, |link, ctx| link.handle_answer_ready(ctx, sdp));
                self.notify_if_complete(&remote_id);
            }
            NegotiationUpdate::RemoteAnswerApplied { remote_id } => {
                self.with_link(&remote_id, |link, _ctx| {
                    link.handle_remote_answer_applied();
                    Ok(())
                });
                self.notify_if_complete(&remote_id);
            }
            NegotiationUpdate::Failed {
                remote_id,
                stage,
                error,
            } => {
                self.with_link(&remote_id, |link, _ctx| {
                    link.handle_failure(stage, &error);
                    Ok(())
                });
                let _ = self.events_out.send(MeshEvent::NegotiationFailed {
                    id: remote_id,
                    error,
                });
            }
        }
    }

    /// Creates the link if absent and applies the offer-role rule, as done
    /// for membership snapshots and join events.
    async fn connect_to(&mut self, remote_id: ParticipantId) {
        if !self.ensure_link(&remote_id).await {
            return;
        }
        let Some(channel) = self.joined.as_ref() else {
            return;
        };
        if glare::should_initiate_offer(&channel.local_id, &remote_id) {
            self.with_link(&remote_id, |link, ctx| {
                link.start_offer(ctx);
                Ok(())
            });
        }
    }

    /// Makes sure a link exists for `remote_id`, creating the connection
    /// handle if needed. Returns false when not joined or the engine
    /// refused the connection.
    async fn ensure_link(&mut self, remote_id: &ParticipantId) -> bool {
        let config = {
            let Some(channel) = self.joined.as_mut() else {
                return false;
            };
            channel.membership.insert(remote_id.clone());
            if channel.links.contains_key(remote_id) {
                return true;
            }
            self.base_config.with_credential(&channel.credential)
        };

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<IceCandidate>();
        let connection = match self.engine.create_connection(&config, candidate_tx).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(
                    target = "mesh::session",
                    remote = %remote_id,
                    error = %error,
                    "failed to create peer connection"
                );
                let _ = self.events_out.send(MeshEvent::NegotiationFailed {
                    id: remote_id.clone(),
                    error,
                });
                return false;
            }
        };

        let forwarder = tokio::spawn({
            let engine_tx = self.engine_tx.clone();
            let epoch = self.epoch;
            let remote_id = remote_id.clone();
            async move {
                while let Some(candidate) = candidate_rx.recv().await {
                    let event = StampedEvent {
                        epoch,
                        signal: EngineSignal::Candidate {
                            remote_id: remote_id.clone(),
                            candidate,
                        },
                    };
                    if engine_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        let Some(channel) = self.joined.as_mut() else {
            forwarder.abort();
            return false;
        };
        tracing::debug!(target = "mesh::session", remote = %remote_id, "peer link created");
        channel.links.insert(
            remote_id.clone(),
            PeerLink::new(remote_id.clone(), connection, forwarder),
        );
        true
    }

    /// Removes the link and membership entry for `remote_id`; returns whether
    /// the participant was actually known.
    fn drop_link(&mut self, remote_id: &ParticipantId) -> bool {
        let Some(channel) = self.joined.as_mut() else {
            return false;
        };
        let known = channel.membership.remove(remote_id);
        if let Some(mut link) = channel.links.remove(remote_id) {
            link.close();
            tracing::debug!(target = "mesh::session", remote = %remote_id, "peer link removed");
        }
        known
    }

    /// Runs `operation` on the link for `remote_id` with a borrowed context.
    /// Missing links are fine: completions for departed peers land here.
    fn with_link<F>(&mut self, remote_id: &ParticipantId, operation: F)
    where
        F: FnOnce(&mut PeerLink, &LinkContext<'_>) -> Result<(), SignalingError>,
    {
        let Some(channel) = self.joined.as_mut() else {
            return;
        };
        let Some(link) = channel.links.get_mut(remote_id) else {
            tracing::trace!(
                target = "mesh::session",
                remote = %remote_id,
                "event for unknown link; ignoring"
            );
            return;
        };
        let ctx = LinkContext {
            channel_id: &channel.channel_id,
            local_id: &channel.local_id,
            epoch: self.epoch,
            events: &self.engine_tx,
            signaling: channel.transport.as_ref(),
        };
        if let Err(err) = operation(link, &ctx) {
            tracing::warn!(
                target = "mesh::session",
                remote = %remote_id,
                error = %err,
                "signaling send failed"
            );
            let _ = self.events_out.send(MeshEvent::SignalingError {
                message: err.to_string(),
            });
        }
    }

    fn notify_if_complete(&mut self, remote_id: &ParticipantId) {
        let Some(channel) = self.joined.as_ref() else {
            return;
        };
        if channel
            .links
            .get(remote_id)
            .is_some_and(|link| link.state() == NegotiationState::RemoteDescriptionSet)
        {
            let _ = self.events_out.send(MeshEvent::NegotiationComplete {
                id: remote_id.clone(),
            });
        }
    }
}
