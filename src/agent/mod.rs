//! Agent module - drives the conversation with the hosted agent.
//!
//! One user utterance is one turn:
//! 1. Append the utterance to the session
//! 2. Start a run and poll it
//! 3. Resolve whatever the run requires: approvals through the policy,
//!    function outputs through the tool registry
//! 4. Read the newest agent turn back as the reply

mod driver;
mod guard;
mod prompt;
mod run;

pub use driver::{AgentContext, TurnDriver, TurnOutcome};
pub use guard::SessionGuard;
pub use prompt::{build_default_instructions, load_instructions};
pub use run::{process_run, RunContext, RunOptions};

/// Where the current turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Submitted,
    Processing,
    AwaitingApproval,
    Completed,
    Terminating,
}
