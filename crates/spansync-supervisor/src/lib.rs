#![warn(missing_docs)]

//! spansync liveness supervision: a hierarchical monitor that heartbeats its
//! children, accounts missed beats, and escalates persistent failures.

pub mod error;
pub mod supervisor;

pub use error::SupervisorError;
pub use supervisor::{
    GenericSupervisor, HeartbeatResponse, Supervisable, SupervisorConfig, SupervisorFailureHandler,
    SupervisorState,
};
