use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RefinementLimits;
use crate::extract::{ExtractionOutcome, extract_with_limit};
use crate::model::{ModelClientError, TextGenerator};

pub mod session;

pub use self::session::{RefinementApplied, RefinementSession, RefinementTicket, ViewMode};

pub const SYSTEM_PROMPT: &str = "You are an expert software architect and product manager. \
Your task is to take a raw app idea and refine it into a professional, detailed specification.\n\n\
Additionally, create a Mermaid.js flowchart or UML diagram that visualizes the core architecture or user flow of this idea.\n\n\
Return ONLY a JSON object with the following structure (no markdown formatting around the JSON):\n\
{\n  \"improvedIdea\": \"The refined, detailed text description...\",\n  \"diagram\": \"The mermaid diagram definition string...\"\n}";

pub const MODEL_FAILURE_MESSAGE: &str = "Sorry, something went wrong while connecting to the AI. Please ensure the model provider is reachable and configured.";

/// Refined description plus flowchart source. An empty `diagram_source` means no diagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementResult {
    #[serde(rename = "improvedIdea")]
    pub description: String,
    #[serde(rename = "diagram")]
    pub diagram_source: String,
}

impl RefinementResult {
    pub fn has_diagram(&self) -> bool {
        !self.diagram_source.trim().is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RefinementError {
    #[error("idea text is required")]
    EmptyIdea,

    #[error("idea text has {chars} chars (max {max})")]
    IdeaTooLong { chars: usize, max: usize },

    #[error("model invocation failed: {0}")]
    ModelInvocation(#[from] ModelClientError),
}

impl RefinementError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::EmptyIdea | Self::IdeaTooLong { .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyIdea => "Describe your idea before refining it.".to_owned(),
            Self::IdeaTooLong { max, .. } => {
                format!("Your idea is too long; keep it under {max} characters.")
            }
            Self::ModelInvocation(_) => MODEL_FAILURE_MESSAGE.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementRequest {
    idea_text: String,
}

impl RefinementRequest {
    pub fn new(idea_text: &str, limits: &RefinementLimits) -> Result<Self, RefinementError> {
        let idea_text = idea_text.trim();
        if idea_text.is_empty() {
            return Err(RefinementError::EmptyIdea);
        }

        let chars = idea_text.chars().count();
        if chars > limits.max_idea_chars {
            return Err(RefinementError::IdeaTooLong {
                chars,
                max: limits.max_idea_chars,
            });
        }

        Ok(Self {
            idea_text: idea_text.to_owned(),
        })
    }

    pub fn idea_text(&self) -> &str {
        &self.idea_text
    }

    fn user_prompt(&self) -> String {
        format!("Raw Idea: {}", self.idea_text)
    }
}

/// Idea in, refined description and diagram source out. Only a failed model call is
/// an error; malformed model output degrades to a plain-text result.
#[derive(Debug, Clone)]
pub struct Refiner<G> {
    generator: G,
    limits: RefinementLimits,
}

impl<G: TextGenerator> Refiner<G> {
    pub fn new(generator: G, limits: RefinementLimits) -> Self {
        Self { generator, limits }
    }

    pub fn limits(&self) -> &RefinementLimits {
        &self.limits
    }

    pub async fn refine(&self, idea_text: &str) -> Result<RefinementResult, RefinementError> {
        let request = RefinementRequest::new(idea_text, &self.limits)?;
        self.refine_request(&request).await
    }

    pub async fn refine_request(
        &self,
        request: &RefinementRequest,
    ) -> Result<RefinementResult, RefinementError> {
        info!(
            idea_chars = request.idea_text().chars().count(),
            "refining idea"
        );

        let raw = self
            .generator
            .generate(SYSTEM_PROMPT, &request.user_prompt())
            .await
            .inspect_err(|error| warn!(error = %error, "model invocation failed"))?;

        let outcome = extract_with_limit(&raw, self.limits.max_response_chars);
        if let ExtractionOutcome::Fallback {
            unparsed, reason, ..
        } = &outcome
        {
            warn!(
                reason = %reason,
                unparsed_chars = unparsed.len(),
                raw_chars = raw.len(),
                "model output was not structured; falling back to raw text"
            );
        }

        let result = outcome.into_result();
        info!(
            description_chars = result.description.len(),
            has_diagram = result.has_diagram(),
            "refinement complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedGenerator;

    fn refiner(generator: ScriptedGenerator) -> Refiner<ScriptedGenerator> {
        Refiner::new(generator, RefinementLimits::default())
    }

    #[tokio::test]
    async fn fenced_model_output_yields_structured_result() {
        let generator = ScriptedGenerator::replying(
            "```json\n{\"improvedIdea\":\"X\",\"diagram\":\"graph TD;A-->B;\"}\n```",
        );
        let result = refiner(generator.clone())
            .refine("a todo app")
            .await
            .expect("refine should succeed");

        assert_eq!(
            result,
            RefinementResult {
                description: "X".to_owned(),
                diagram_source: "graph TD;A-->B;".to_owned(),
            }
        );
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, SYSTEM_PROMPT);
        assert_eq!(prompts[0].1, "Raw Idea: a todo app");
    }

    #[tokio::test]
    async fn refusal_yields_plain_text_without_diagram() {
        let result = refiner(ScriptedGenerator::replying("Sorry, I cannot comply."))
            .refine("idea")
            .await
            .expect("refine should succeed");

        assert_eq!(result.description, "Sorry, I cannot comply.");
        assert_eq!(result.diagram_source, "");
        assert!(!result.has_diagram());
    }

    #[tokio::test]
    async fn blank_idea_is_rejected_before_model_call() {
        let generator = ScriptedGenerator::replying("unused");
        let error = refiner(generator.clone())
            .refine(" \n\t")
            .await
            .expect_err("blank idea should fail");

        assert!(matches!(error, RefinementError::EmptyIdea));
        assert!(error.is_invalid_input());
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn oversized_idea_is_rejected() {
        let limits = RefinementLimits {
            max_idea_chars: 5,
            ..RefinementLimits::default()
        };
        let error = Refiner::new(ScriptedGenerator::replying("unused"), limits)
            .refine("abcdef")
            .await
            .expect_err("long idea should fail");

        assert!(matches!(
            error,
            RefinementError::IdeaTooLong { chars: 6, max: 5 }
        ));
    }

    #[tokio::test]
    async fn model_failure_is_the_only_error_that_escapes() {
        let error = refiner(ScriptedGenerator::failing("quota exhausted"))
            .refine("idea")
            .await
            .expect_err("model failure should propagate");

        assert!(matches!(error, RefinementError::ModelInvocation(_)));
        assert!(!error.is_invalid_input());
        assert_eq!(error.user_message(), MODEL_FAILURE_MESSAGE);
        assert!(error.to_string().contains("quota exhausted"));
    }

    #[test]
    fn result_serializes_with_wire_field_names() {
        let result = RefinementResult {
            description: "d".to_owned(),
            diagram_source: "graph TD".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&result).expect("result should serialize"),
            serde_json::json!({"improvedIdea": "d", "diagram": "graph TD"})
        );
    }
}
