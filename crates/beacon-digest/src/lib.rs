//! The opportunity digest job: filter pipeline, dedup gate, dispatcher, run
//! recorder and their orchestration.

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod job;
pub mod recorder;
pub mod scheduler;

pub use config::DigestConfig;
pub use dedup::DedupGate;
pub use dispatch::{
    render_digest_html, DigestDispatcher, DigestTemplate, DispatchMode, DispatchOutcome,
    EmailError, EmailMessage, EmailSender, ResendSender, SendReceipt,
};
pub use error::DigestError;
pub use filter::{FilterPipeline, FilterReport, FilterStage, Verdict};
pub use job::{run_digest_once_from_env, DigestJob, RunOptions, RunSummary, UserFailure};
pub use recorder::{ActiveRun, RunRecorder, RunTotals};
pub use scheduler::{build_scheduler, maybe_build_scheduler};

pub const CRATE_NAME: &str = "beacon-digest";
