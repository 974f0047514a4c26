//! Error types for the supervision subsystem.

use thiserror::Error;

use spansync_base::settings::SettingsError;

use crate::supervisor::SupervisorState;

/// Errors that can occur in the supervision subsystem.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supplied settings map failed validation.
    #[error("invalid supervisor settings")]
    InvalidSettings(#[from] SettingsError),

    /// No child with the given id is supervised.
    #[error("child \"{id}\" is not supervised")]
    ChildNotFound {
        /// The id that was looked up.
        id: String,
    },

    /// The supervisor is not in the `Running` state.
    #[error("supervisor is not running")]
    NotRunning,

    /// `start` was called from a state that cannot start.
    #[error("supervisor cannot start from state {state:?}")]
    AlreadyStarted {
        /// The state the supervisor was in.
        state: SupervisorState,
    },

    /// A child could not accept a heartbeat request.
    #[error("child \"{id}\" cannot accept a heartbeat: {msg}")]
    HeartbeatRefused {
        /// The child that refused.
        id: String,
        /// Why the heartbeat could not be queued.
        msg: String,
    },
}
