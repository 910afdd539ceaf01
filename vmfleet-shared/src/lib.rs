//! vmfleet shared code
//!
//! Error taxonomy used by the orchestrator and its CLI, plus the guest-side
//! conventions the rendered seed documents depend on.

pub mod constants;
pub mod errors;

pub use errors::{
    AllocationError, BestEffortError, FleetError, FleetResult, InstanceError, PreconditionError,
    Stage,
};
