//! Provisioning state machine
//!
//! Tracks which synchronization stage the node is in. Stages only advance in
//! order: WiFi, then identity, then sensor credentials.

use crate::status_led::LedStatus;
use crate::sync::RestartReason;
use log::{error, info};

/// Provisioning stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    WiFiPending,
    IdentityPending,
    CredentialPending,
    AllSynced,

    // Terminal states
    Restarting(RestartReason),
    Failed,
}

/// Stage results reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    WiFiResolved,
    IdentityResolved,
    CredentialsResolved,
    RestartRequested(RestartReason),
    StageFailed,
}

/// Result of feeding one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// Event ignored in the current state
    Stay,
    /// Moved to a new state
    Transition(SyncState),
}

/// Tracks which provisioning stage the node is in
pub struct SyncStateMachine {
    current_state: SyncState,
    previous_state: Option<SyncState>,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: SyncState::WiFiPending,
            previous_state: None,
        }
    }

    pub fn get_current_state(&self) -> SyncState {
        self.current_state
    }

    pub fn get_previous_state(&self) -> Option<SyncState> {
        self.previous_state
    }

    /// LED status for the current state
    pub fn get_led_status(&self) -> LedStatus {
        match self.current_state {
            SyncState::WiFiPending => LedStatus::WiFiSync,
            SyncState::IdentityPending => LedStatus::IdentitySync,
            SyncState::CredentialPending => LedStatus::BrokerSync,
            SyncState::AllSynced => LedStatus::Synced,
            SyncState::Restarting(_) => LedStatus::Restarting,
            SyncState::Failed => LedStatus::Error,
        }
    }

    pub fn handle_event(&mut self, event: SyncEvent) -> StateTransition {
        let transition = self.get_state_transition(self.current_state, event);

        if let StateTransition::Transition(new_state) = transition {
            self.transition_to_state(new_state);
        }

        transition
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.current_state,
            SyncState::AllSynced | SyncState::Restarting(_) | SyncState::Failed
        )
    }

    fn transition_to_state(&mut self, new_state: SyncState) {
        if new_state != self.current_state {
            match new_state {
                SyncState::AllSynced => info!("[STATE] All records synced"),
                SyncState::Restarting(reason) => info!("[STATE] Restart requested: {:?}", reason),
                SyncState::Failed => {
                    error!("[STATE] Stage failed in {:?}", self.current_state)
                }
                _ => info!("[STATE] {:?} -> {:?}", self.current_state, new_state),
            }

            self.previous_state = Some(self.current_state);
            self.current_state = new_state;
        }
    }

    fn get_state_transition(&self, current_state: SyncState, event: SyncEvent) -> StateTransition {
        let pending = matches!(
            current_state,
            SyncState::WiFiPending | SyncState::IdentityPending | SyncState::CredentialPending
        );

        match (current_state, event) {
            (SyncState::WiFiPending, SyncEvent::WiFiResolved) => {
                StateTransition::Transition(SyncState::IdentityPending)
            }
            (SyncState::IdentityPending, SyncEvent::IdentityResolved) => {
                StateTransition::Transition(SyncState::CredentialPending)
            }
            (SyncState::CredentialPending, SyncEvent::CredentialsResolved) => {
                StateTransition::Transition(SyncState::AllSynced)
            }

            (_, SyncEvent::RestartRequested(reason)) if pending => {
                StateTransition::Transition(SyncState::Restarting(reason))
            }
            (_, SyncEvent::StageFailed) if pending => StateTransition::Transition(SyncState::Failed),

            // Out-of-order events leave the state alone
            _ => StateTransition::Stay,
        }
    }
}
