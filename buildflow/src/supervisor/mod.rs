//! Supervision of stage processes.
//!
//! Each stage runs in its own process group with stdin closed (or carrying
//! only the elevation credential) and stdout/stderr merged into one line
//! stream. A writer task persists the stream while the supervisor scans it
//! for blocking prompts; a prompt, a timeout or cancellation terminates the
//! whole group.

mod detector;
mod invocation;
mod output;
mod process;
mod registry;
mod signals;

pub use detector::{PromptDetector, DEFAULT_PROMPT_SIGNATURES};
pub use invocation::Invocation;
pub use output::LogTail;
pub use process::{
    default_non_interactive_env, ExecutionRequest, ProcessSupervisor, StageResult, SupervisorConfig,
};
pub use registry::{CleanupReport, ProcessRegistry};
pub use signals::GroupTermination;
