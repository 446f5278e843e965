//! Three-stage reasoning pipeline: Classify (the brain), Generate (the
//! mouth), Summarize (the memory).
//!
//! Every stage sends one chat request, runs the JSON extraction ladder
//! over the reply, and builds a typed output with loose enum parsing so
//! a confused model can never crash the orchestrator. Retries and the
//! per-call deadline live in [`stages`].

use std::sync::Arc;

use lf_domain::config::LlmConfig;
use lf_domain::Result;

pub mod client;
pub mod extract;
pub mod input;
pub mod prompts;
pub mod rules;
pub mod schema;
pub mod stages;

pub use client::{ChatRequest, HttpLlmClient, LlmClient};
pub use input::PipelineInput;
pub use schema::{ClassifyOutput, GenerateOutput, RiskFlags, SummaryOutput};

/// The seam the orchestrator depends on. [`LlmPipeline`] is the real
/// implementation; tests substitute scripted fakes.
#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    /// Decide what to do with this turn.
    async fn classify(&self, input: &PipelineInput) -> Result<ClassifyOutput>;

    /// Draft the outbound reply for a classification that wants one.
    async fn generate(
        &self,
        input: &PipelineInput,
        classification: &ClassifyOutput,
    ) -> Result<GenerateOutput>;

    /// Fold the latest exchange into the rolling summary.
    async fn summarize(
        &self,
        input: &PipelineInput,
        user_message: &str,
        bot_message: Option<&str>,
    ) -> Result<SummaryOutput>;
}

/// Production pipeline backed by an [`LlmClient`].
pub struct LlmPipeline {
    client: Arc<dyn LlmClient>,
    config: LlmConfig,
}

impl LlmPipeline {
    pub fn new(client: Arc<dyn LlmClient>, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait::async_trait]
impl Reasoner for LlmPipeline {
    async fn classify(&self, input: &PipelineInput) -> Result<ClassifyOutput> {
        stages::classify(self.client.as_ref(), &self.config, input).await
    }

    async fn generate(
        &self,
        input: &PipelineInput,
        classification: &ClassifyOutput,
    ) -> Result<GenerateOutput> {
        stages::generate(self.client.as_ref(), &self.config, input, classification).await
    }

    async fn summarize(
        &self,
        input: &PipelineInput,
        user_message: &str,
        bot_message: Option<&str>,
    ) -> Result<SummaryOutput> {
        stages::summarize(self.client.as_ref(), &self.config, input, user_message, bot_message)
            .await
    }
}
