//! Engine supervision: launching the headless rendering daemon, driving its
//! HTTP API, and collecting the artifacts it produces.

pub use client::{ENGINE_PORT, EngineClient, PromptOutcome};
pub use error::EngineError;
pub use outputs::{collect_artifacts, collect_filenames};
pub use supervisor::{
    Artifact, EngineSettings, EngineSupervisor, READY_TIMEOUT, STOP_GRACE, WORKFLOW_TIMEOUT,
    run_workflow,
};

mod client;
mod error;
mod outputs;
mod supervisor;
