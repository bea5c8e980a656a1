//! Pipeline orchestrator
//!
//! Per request: compile the prompt, then up to `max_attempts` rounds of
//! call -> parse -> validate, then execute. Anything unusable from the LLM is
//! retried with feedback; running out of attempts, having no credential, or
//! missing the CAD library drops to the deterministic fallback. Every path
//! ends in a [`PipelineResult`].

use crate::executor::{ExecutionError, ExportArtifact, SandboxedExecutor};
use crate::fallback::{self, synthesize_box_gltf};
use crate::parser::{ParsedResponse, ResponseParser};
use crate::plan::GeometryPlan;
use crate::prompt::{build_user_message, compile_prompt, SYSTEM_PROMPT};
use crate::provider::{provider_from_config, CompletionClient, LlmProvider, ProviderError};
use crate::validator::validate;
use crate::CadAgentConfig;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// How a result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Llm,
    Fallback,
    /// Fallback preview built without the CAD library
    Synthetic,
    /// Caller-supplied script
    Direct,
}

/// Outward-facing result of one request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(rename = "jsonPlan", skip_serializing_if = "Option::is_none")]
    pub json_plan: Option<GeometryPlan>,

    #[serde(rename = "pythonCode", skip_serializing_if = "Option::is_none")]
    pub python_code: Option<String>,

    /// glTF JSON text or a base64 data URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,

    /// STEP text when the script produced one alongside the preview
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "is_false")]
    pub fallback_available: bool,

    #[serde(skip)]
    pub source: Source,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl PipelineResult {
    fn exported(source: Source, artifact: ExportArtifact, message: String) -> Self {
        Self {
            success: true,
            prompt: None,
            json_plan: None,
            python_code: None,
            export: Some(artifact.export),
            step: artifact.step,
            error: None,
            message: Some(message),
            fallback_available: false,
            source,
        }
    }

    /// Failure body; generation artifacts can be attached afterwards
    pub fn failure(source: Source, error: impl Into<String>) -> Self {
        Self {
            success: false,
            prompt: None,
            json_plan: None,
            python_code: None,
            export: None,
            step: None,
            error: Some(error.into()),
            message: None,
            fallback_available: true,
            source,
        }
    }

    fn with_generation(mut self, prompt: &str, plan: GeometryPlan, code: String) -> Self {
        self.prompt = Some(prompt.to_string());
        self.json_plan = Some(plan);
        self.python_code = Some(code);
        self
    }
}

/// Why the fallback generator was used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NoCredential,
    AttemptsExhausted(usize),
    LibraryUnavailable,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoCredential => write!(f, "no LLM credential configured"),
            FallbackReason::AttemptsExhausted(n) => {
                write!(f, "no usable LLM answer after {n} attempts")
            }
            FallbackReason::LibraryUnavailable => write!(f, "CAD library unavailable"),
        }
    }
}

pub struct CadPipeline {
    max_attempts: usize,
    client: Option<CompletionClient>,
    parser: ResponseParser,
    executor: SandboxedExecutor,
}

impl CadPipeline {
    pub fn new(
        config: &CadAgentConfig,
        provider: Option<Arc<dyn LlmProvider>>,
        executor: SandboxedExecutor,
    ) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            client: provider.map(|p| CompletionClient::new(p, &config.llm)),
            parser: ResponseParser::new(),
            executor,
        }
    }

    /// Pipeline wired to the configured provider and Python runner
    pub fn from_config(config: &CadAgentConfig) -> Result<Self, ProviderError> {
        let provider = provider_from_config(&config.llm)?;
        Ok(Self::new(
            config,
            provider,
            SandboxedExecutor::from_config(&config.executor),
        ))
    }

    pub fn llm_configured(&self) -> bool {
        self.client.is_some()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn executor(&self) -> &SandboxedExecutor {
        &self.executor
    }

    /// Turn a text prompt into a model
    pub async fn generate(&self, prompt: &str) -> PipelineResult {
        let Some(client) = &self.client else {
            return self.fallback(prompt, FallbackReason::NoCredential).await;
        };

        let instruction = compile_prompt(prompt);
        let mut feedback: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let message = build_user_message(&instruction, feedback.as_deref());

            let Some(text) = client.complete(SYSTEM_PROMPT, &message).await else {
                warn!(attempt, "Attempt produced no completion");
                feedback = Some("no answer was received".to_string());
                continue;
            };

            let parsed = self.parser.parse(&text);
            if let Some(missing) = parsed.missing() {
                warn!(attempt, reason = %missing, "Completion unusable");
                feedback = Some(missing);
                continue;
            }

            let ParsedResponse { json_plan, code } = parsed;
            let plan = match validate(json_plan.as_ref(), code.as_deref()) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(attempt, reason = %e, "Plan/script pair rejected");
                    feedback = Some(e.to_string());
                    continue;
                }
            };
            let code = code.unwrap_or_default();

            info!(
                attempt,
                objects = plan.objects.len(),
                operations = plan.operations.len(),
                "Executing generated script"
            );

            return match self.executor.execute(&code).await {
                Ok(artifact) => {
                    let message = format!(
                        "Generated with {} on attempt {attempt}",
                        client.provider_name()
                    );
                    PipelineResult::exported(Source::Llm, artifact, message)
                        .with_generation(prompt, plan, code)
                }
                Err(ExecutionError::LibraryUnavailable(detail)) => {
                    warn!(detail = %detail, "CAD library unavailable, falling back");
                    self.fallback(prompt, FallbackReason::LibraryUnavailable)
                        .await
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Generated script failed");
                    PipelineResult::failure(Source::Llm, e.to_string())
                        .with_generation(prompt, plan, code)
                }
            };
        }

        self.fallback(prompt, FallbackReason::AttemptsExhausted(self.max_attempts))
            .await
    }

    async fn fallback(&self, prompt: &str, reason: FallbackReason) -> PipelineResult {
        let design = fallback::design(prompt);
        info!(reason = %reason, shape = ?design.shape, "Using fallback generator");

        // Known-missing library: skip straight to the synthetic preview
        let outcome = match reason {
            FallbackReason::LibraryUnavailable => Err(ExecutionError::LibraryUnavailable(
                reason.to_string(),
            )),
            _ => self.executor.execute(&design.script).await,
        };

        let result = match outcome {
            Ok(artifact) => PipelineResult::exported(
                Source::Fallback,
                artifact,
                format!("Generated with the fallback generator ({reason})"),
            ),
            Err(ExecutionError::LibraryUnavailable(_)) => {
                let (width, height, depth) = design.shape.bounding_box();
                synthetic(
                    synthesize_box_gltf(width, height, depth),
                    format!("Synthetic fallback preview ({reason}; CAD library unavailable)"),
                )
            }
            Err(e) => {
                warn!(error = %e, "Fallback script failed");
                PipelineResult::failure(Source::Fallback, format!("Fallback generation failed: {e}"))
            }
        };

        result.with_generation(prompt, design.plan, design.script)
    }

    /// Run a caller-supplied script directly, skipping the LLM
    pub async fn execute_script(&self, code: &str) -> PipelineResult {
        if code.trim().is_empty() {
            return PipelineResult::failure(Source::Direct, "No Python code provided");
        }

        match self.executor.execute(code).await {
            Ok(artifact) => PipelineResult::exported(
                Source::Direct,
                artifact,
                "Model generated successfully".to_string(),
            ),
            Err(ExecutionError::LibraryUnavailable(detail)) => {
                let (width, height, depth) = fallback::dimensions_from_script(code);
                info!(
                    detail = %detail,
                    width, height, depth,
                    "CAD library unavailable, synthesizing preview from script"
                );
                synthetic(
                    synthesize_box_gltf(width, height, depth),
                    "CAD library unavailable; returned a synthetic preview".to_string(),
                )
            }
            Err(e) => PipelineResult::failure(Source::Direct, e.to_string()),
        }
    }
}

fn synthetic(gltf: String, message: String) -> PipelineResult {
    PipelineResult::exported(
        Source::Synthetic,
        ExportArtifact {
            export: gltf,
            step: None,
            file_name: "fallback.gltf".to_string(),
        },
        message,
    )
}
