//! Call state seen by the host.
//!
//! The host tracks the phase of every call it hosts mini-apps in.
//! Capability actions that depend on call state read it through
//! [`CallStateProvider`]. Call control actions go to a [`CallControl`]
//! collaborator. Every phase change, whichever side caused it, goes through
//! [`PhaseTracker`] so the call's apps hear about it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use callcap_core::NotifyEvent;
use callcap_core::envelope::notify;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::link::MiniAppLinks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Dialing,
    Ringing,
    Active,
    Holding,
    Disconnected,
}

impl CallPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Holding => "holding",
            Self::Disconnected => "disconnected",
        }
    }

    /// Phases in which phase-sensitive capability actions may run.
    pub const fn allows_capabilities(self) -> bool {
        matches!(self, Self::Active | Self::Holding)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous, side-effect free read of a call's phase.
pub trait CallStateProvider: Send + Sync {
    fn call_phase(&self, call_id: &str) -> Option<CallPhase>;
}

/// In-memory call phase table.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    phases: Arc<RwLock<HashMap<String, CallPhase>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `phase`. Returns whether it differs from the previous one.
    pub fn set_phase(&self, call_id: &str, phase: CallPhase) -> bool {
        let previous = match self.phases.write() {
            Ok(mut phases) => phases.insert(call_id.to_string(), phase),
            Err(poisoned) => poisoned.into_inner().insert(call_id.to_string(), phase),
        };
        let changed = previous != Some(phase);
        if changed {
            info!(call_id, %phase, "Call phase changed");
        }
        changed
    }

    pub fn remove(&self, call_id: &str) -> Option<CallPhase> {
        let removed = match self.phases.write() {
            Ok(mut phases) => phases.remove(call_id),
            Err(poisoned) => poisoned.into_inner().remove(call_id),
        };
        debug!(call_id, "Call removed from registry");
        removed
    }
}

impl CallStateProvider for CallRegistry {
    fn call_phase(&self, call_id: &str) -> Option<CallPhase> {
        match self.phases.read() {
            Ok(phases) => phases.get(call_id).copied(),
            Err(poisoned) => poisoned.into_inner().get(call_id).copied(),
        }
    }
}

/// Phase writes that announce themselves.
///
/// A change pushes `callStateNotify` to every app attached in the call.
/// Setting the phase a call already has is silent.
#[derive(Clone)]
pub struct PhaseTracker {
    calls: CallRegistry,
    links: MiniAppLinks,
}

impl PhaseTracker {
    pub const fn new(calls: CallRegistry, links: MiniAppLinks) -> Self {
        Self { calls, links }
    }

    pub const fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    /// Record `phase` for `call_id`. Returns how many apps were notified.
    pub async fn set_phase(&self, call_id: &str, phase: CallPhase) -> usize {
        if !self.calls.set_phase(call_id, phase) {
            return 0;
        }
        let event = NotifyEvent::new(notify::CALL_STATE_NOTIFY)
            .with_param("callId", call_id)
            .with_param("state", phase.as_str());
        let notified = self.links.notify_call(call_id, &event).await;
        debug!(call_id, %phase, notified, "Call phase announced");
        notified
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallControlError {
    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("call control rejected: {0}")]
    Rejected(String),
}

/// Call-control actions mini-apps may trigger.
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn hang_up(&self, call_id: &str) -> Result<(), CallControlError>;
    async fn answer(&self, call_id: &str) -> Result<(), CallControlError>;
    async fn set_muted(&self, call_id: &str, muted: bool) -> Result<(), CallControlError>;
}

/// Call control that only moves phases through a [`PhaseTracker`].
///
/// Stands in for a telephony stack when none is attached.
#[derive(Clone)]
pub struct RegistryCallControl {
    phases: PhaseTracker,
}

impl RegistryCallControl {
    pub const fn new(phases: PhaseTracker) -> Self {
        Self { phases }
    }
}

#[async_trait]
impl CallControl for RegistryCallControl {
    async fn hang_up(&self, call_id: &str) -> Result<(), CallControlError> {
        match self.phases.calls().call_phase(call_id) {
            None => Err(CallControlError::UnknownCall(call_id.to_string())),
            Some(CallPhase::Disconnected) => Err(CallControlError::Rejected(
                "call already disconnected".into(),
            )),
            Some(_) => {
                self.phases.set_phase(call_id, CallPhase::Disconnected).await;
                Ok(())
            }
        }
    }

    async fn answer(&self, call_id: &str) -> Result<(), CallControlError> {
        match self.phases.calls().call_phase(call_id) {
            None => Err(CallControlError::UnknownCall(call_id.to_string())),
            Some(CallPhase::Ringing) => {
                self.phases.set_phase(call_id, CallPhase::Active).await;
                Ok(())
            }
            Some(phase) => Err(CallControlError::Rejected(format!("call is {phase}"))),
        }
    }

    async fn set_muted(&self, call_id: &str, muted: bool) -> Result<(), CallControlError> {
        match self.phases.calls().call_phase(call_id) {
            None => Err(CallControlError::UnknownCall(call_id.to_string())),
            Some(phase) if phase.allows_capabilities() => {
                debug!(call_id, muted, "Mute state changed");
                Ok(())
            }
            Some(phase) => Err(CallControlError::Rejected(format!("call is {phase}"))),
        }
    }
}
