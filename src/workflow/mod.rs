//! The chapter state machine.
//!
//! ```text
//! RAW -> DRAFTED -> SPUN -> AI_REVIEWED -> HUMAN_REVIEW_PENDING -> FINALIZED
//!                    ^  ^        |                  |
//!                    |  +--------+ (revise)         | (reject)
//!                    +----------------------------- +
//! ```
//!
//! Any phase may end in `ABANDONED` once a retry budget runs out.

mod batch;
mod engine;
pub mod policy;

pub use batch::BatchOutcome;
pub use engine::{
    Advance, ChapterReport, Collaborators, VersionSummary, WorkflowEngine, WorkflowStatistics,
};
