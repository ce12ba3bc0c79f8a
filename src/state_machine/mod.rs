mod job;
mod state;

pub use job::{
    AttemptOutcome, AttemptResult, FailureKind, Resources, RetryConfig, SessionRecord, WorkUnit,
};
pub use state::{InvalidTransition, JobState, StateMachine, Transition};
