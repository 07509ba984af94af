//! Remote collaborators of the research pipeline.
//!
//! The deep-research service runs long interactions in the background: a
//! submit returns an interaction handle, and the handle is polled until the
//! service reports a terminal state. A second, cheaper model call reformats
//! unparseable research output into the expected schema.
//!
//! Both are traits so the job state machine can be driven by fakes in tests;
//! [`GeminiClient`] implements them against the Gemini HTTP API.

mod gemini;

use async_trait::async_trait;
use leadscout_shared::Result;

pub use gemini::GeminiClient;

/// Status reported by the research service for an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RemoteState {
    /// Map the service's status string. Unknown states count as running so
    /// the job is simply checked again next cycle.
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "done" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            "pending" | "queued" => Self::Pending,
            _ => Self::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of a remote interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionStatus {
    pub state: RemoteState,
    /// Final text output, present once the interaction completed.
    pub payload: Option<String>,
    /// Service-provided failure detail.
    pub error: Option<String>,
}

/// Long-running research interactions.
#[async_trait]
pub trait ResearchService: Send + Sync {
    /// Start a background interaction. Returns the interaction handle.
    async fn submit(&self, prompt: &str, schema: &serde_json::Value) -> Result<String>;

    /// Fetch the current status of an interaction.
    async fn get_status(&self, interaction_id: &str) -> Result<InteractionStatus>;
}

/// Auxiliary fast inference used as the last parser tier.
#[async_trait]
pub trait Reformatter: Send + Sync {
    /// Rewrite free-form research text into JSON matching `schema`.
    async fn reformat(&self, raw_text: &str, schema: &serde_json::Value) -> Result<String>;
}
