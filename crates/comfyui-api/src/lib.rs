//! Client for the HTTP API of a ComfyUI server.
//!
//! * [`api`] has one client per endpoint (`prompt`, `history`, `view`,
//!   `system_stats`).
//! * [`models`] has the wire types.
//! * [`workflow`] converts the editor's export format to API format.
//! * [`comfy`] submits prompts, polls for results, downloads outputs and
//!   patches well known fields of a graph.

pub mod api;
pub mod comfy;
pub mod models;
pub mod workflow;

pub use api::{Api, ApiError};
pub use comfy::{Comfy, ComfyError, DownloadSummary, JobOutcome, JobReport, PollSettings};
pub use models::*;
pub use workflow::{Workflow, WorkflowFile};
