//! In-process engine that answers requests from a script. Used by tests and
//! by the CLI when no video backend is linked.

use super::VideoError;
use super::engine::{EncoderProfile, EngineEvent, JoinRequest, VideoEngine};
use crate::events::EventStream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

const LOCAL_UID: u32 = 0;
const PEER_UID: u32 = 1001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackScript {
    pub confirm_join: bool,
    pub confirm_leave: bool,
    pub reject_join: bool,
    /// Announce a peer and a first frame right after the join confirmation.
    pub peer_on_join: bool,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            confirm_join: true,
            confirm_leave: true,
            reject_join: false,
            peer_on_join: false,
        }
    }
}

pub struct LoopbackEngine {
    events: EventStream<EngineEvent>,
    script: Mutex<LoopbackScript>,
    profile: Mutex<Option<EncoderProfile>>,
    joins: Mutex<Vec<JoinRequest>>,
    leaves: AtomicUsize,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackScript::default())
    }
}

impl LoopbackEngine {
    pub fn new(script: LoopbackScript) -> Self {
        Self {
            events: EventStream::default(),
            script: Mutex::new(script),
            profile: Mutex::new(None),
            joins: Mutex::new(Vec::new()),
            leaves: AtomicUsize::new(0),
        }
    }

    pub fn set_script(&self, script: LoopbackScript) {
        *self.script.lock() = script;
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    pub fn peer_frame(&self) {
        self.emit(EngineEvent::Frame { uid: PEER_UID });
    }

    pub fn peer_first_frame(&self) {
        self.emit(EngineEvent::FirstFrame {
            uid: PEER_UID,
            width: 1280,
            height: 720,
        });
    }

    pub fn joins(&self) -> Vec<JoinRequest> {
        self.joins.lock().clone()
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn profile(&self) -> Option<EncoderProfile> {
        *self.profile.lock()
    }
}

#[async_trait]
impl VideoEngine for LoopbackEngine {
    async fn initialize(&self, app_id: &str, profile: &EncoderProfile) -> Result<(), VideoError> {
        if app_id.is_empty() {
            return Err(VideoError::Init("empty app id".into()));
        }
        *self.profile.lock() = Some(*profile);
        Ok(())
    }

    async fn join(&self, request: &JoinRequest) -> Result<(), VideoError> {
        self.joins.lock().push(request.clone());
        let script = *self.script.lock();
        if script.reject_join {
            return Err(VideoError::JoinRejected("scripted rejection".into()));
        }
        if script.confirm_join {
            self.emit(EngineEvent::JoinConfirmed { uid: LOCAL_UID });
            if script.peer_on_join {
                self.emit(EngineEvent::PeerJoined { uid: PEER_UID });
                self.peer_first_frame();
            }
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), VideoError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        if self.script.lock().confirm_leave {
            self.emit(EngineEvent::LeaveConfirmed);
        }
        Ok(())
    }

    fn leave_blocking(&self, _budget: Duration) -> bool {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.script.lock().confirm_leave
    }

    fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
