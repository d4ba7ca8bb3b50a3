//! Scripted media engine for exercising the negotiation core without a
//! WebRTC stack.

use super::{AnswerConstraints, IceCandidate, MediaEngine, MediaError, PeerConnection};
use crate::config::RtcConfig;
use crate::protocol::SdpKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

struct EngineShared {
    hold_offers: AtomicBool,
    offer_permits: Semaphore,
    fail_remote_description: AtomicBool,
}

/// Mock [`MediaEngine`]. Connections are handed out in creation order and
/// kept for inspection; offer creation can be held back with
/// [`MockMediaEngine::hold_offers`] to widen the window in which candidates
/// arrive before the offer exists.
pub struct MockMediaEngine {
    shared: Arc<EngineShared>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    next_id: AtomicUsize,
}

impl MockMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(EngineShared {
                hold_offers: AtomicBool::new(false),
                offer_permits: Semaphore::new(0),
                fail_remote_description: AtomicBool::new(false),
            }),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Makes `create_offer` block until [`Self::release_offer`] is called.
    pub fn hold_offers(&self) {
        self.shared.hold_offers.store(true, Ordering::SeqCst);
    }

    pub fn release_offer(&self) {
        self.shared.offer_permits.add_permits(1);
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.shared
            .fail_remote_description
            .store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock()[index].clone()
    }

    /// Waits until at least `count` connections have been created.
    pub async fn wait_for_connections(&self, count: usize) {
        loop {
            if self.connections.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_connection(
        &self,
        config: &RtcConfig,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            id,
            shared: self.shared.clone(),
            candidates,
            state: Mutex::new(ConnectionState {
                config: config.clone(),
                ..ConnectionState::default()
            }),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct ConnectionState {
    config: RtcConfig,
    local_description: Option<(SdpKind, String)>,
    remote_description: Option<(SdpKind, String)>,
    applied_candidates: Vec<IceCandidate>,
    answer_constraints: Option<AnswerConstraints>,
    renewed_credential: Option<String>,
    closed: bool,
}

pub struct MockConnection {
    id: usize,
    shared: Arc<EngineShared>,
    candidates: mpsc::UnboundedSender<IceCandidate>,
    state: Mutex<ConnectionState>,
}

impl MockConnection {
    /// Simulates the engine gathering a local candidate.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self.candidates.send(candidate);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn local_description(&self) -> Option<(SdpKind, String)> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<(SdpKind, String)> {
        self.state.lock().remote_description.clone()
    }

    pub fn answer_constraints(&self) -> Option<AnswerConstraints> {
        self.state.lock().answer_constraints
    }

    pub fn renewed_credential(&self) -> Option<String> {
        self.state.lock().renewed_credential.clone()
    }

    pub fn config(&self) -> RtcConfig {
        self.state.lock().config.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        if self.shared.hold_offers.load(Ordering::SeqCst) {
            let permit = self
                .shared
                .offer_permits
                .acquire()
                .await
                .expect("offer gate closed");
            permit.forget();
        }
        Ok(format!("mock-offer-{}", self.id))
    }

    async fn create_answer(&self, constraints: AnswerConstraints) -> Result<String, MediaError> {
        self.state.lock().answer_constraints = Some(constraints);
        Ok(format!("mock-answer-{}", self.id))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        self.state.lock().local_description = Some((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError> {
        if self.shared.fail_remote_description.load(Ordering::SeqCst) {
            return Err(MediaError::SetRemoteDescription(
                "rejected by mock engine".into(),
            ));
        }
        let mut state = self.state.lock();
        state.remote_description = Some((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.state.lock().applied_candidates.push(candidate);
        Ok(())
    }

    fn update_ice_credential(&self, credential: &str) {
        self.state.lock().renewed_credential = Some(credential.to_string());
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}
