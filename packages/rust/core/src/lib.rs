//! Research job pipeline for LeadScout.
//!
//! Jobs are submitted to a long-running research service, polled until the
//! service finishes, and their output is parsed and reconciled into the
//! persisted record set:
//!
//! poll cycle → job state machine → research service → response parser
//! → record matcher → record merger → storage
//!
//! Each stage sits behind a trait so the state machine can be driven by
//! fakes in tests.

pub mod jobs;
pub mod matcher;
pub mod merger;
pub mod parser;
pub mod poll;
pub mod prompt;
pub mod reconcile;

pub use jobs::{JobLifecycle, JobMachine, PollOutcome};
pub use matcher::{KeyMatcher, RecordMatcher};
pub use merger::{FillBlanksMerger, MergeOutcome, RecordMerger};
pub use parser::{ParsedResponse, ResponseParser, TieredParser, response_schema};
pub use poll::{PollOrchestrator, PollSummary};
pub use prompt::PromptConfig;
pub use reconcile::ReconcileSummary;

#[cfg(test)]
pub(crate) mod test_support;
