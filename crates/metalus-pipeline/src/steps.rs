//! Built-in step catalog registered under the `metalus` package.
//!
//! A small set of general-purpose bodies so applications can run without a
//! custom step library: string helpers, logging, and structured flow stops.

use std::collections::HashMap;

use async_trait::async_trait;
use metalus_types::{Result, StepOutcome, Value, ValueKind};

use crate::context::PipelineContext;
use crate::registry::{ArgSpec, StepFunction, StepRegistry, StepSignature};

const PACKAGE: &str = "metalus";

/// `StringSteps.concat(left, right)`.
struct Concat;

#[async_trait]
impl StepFunction for Concat {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "StringSteps",
            "concat",
            vec![
                ArgSpec::new("left").of_kind(ValueKind::String).required(),
                ArgSpec::new("right").of_kind(ValueKind::String).required(),
            ],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        let left = args.get("left").cloned().unwrap_or(Value::None);
        let right = args.get("right").cloned().unwrap_or(Value::None);
        Ok(StepOutcome::Value(Value::String(format!(
            "{}{}",
            left.to_display_string(),
            right.to_display_string()
        ))))
    }
}

/// `StringSteps.concat(left, right, separator)` — the wider overload.
struct ConcatWithSeparator;

#[async_trait]
impl StepFunction for ConcatWithSeparator {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "StringSteps",
            "concat",
            vec![
                ArgSpec::new("left").of_kind(ValueKind::String).required(),
                ArgSpec::new("right").of_kind(ValueKind::String).required(),
                ArgSpec::new("separator")
                    .of_kind(ValueKind::String)
                    .with_default(Value::String("-".into())),
            ],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        let piece = |name: &str| {
            args.get(name)
                .map(Value::to_display_string)
                .unwrap_or_default()
        };
        Ok(StepOutcome::Value(Value::String(format!(
            "{}{}{}",
            piece("left"),
            piece("separator"),
            piece("right")
        ))))
    }
}

/// `StringSteps.upperCase(value)`.
struct UpperCase;

#[async_trait]
impl StepFunction for UpperCase {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "StringSteps",
            "upperCase",
            vec![ArgSpec::new("value").of_kind(ValueKind::String).required()],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        let value = args
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_uppercase();
        Ok(StepOutcome::Value(Value::String(value)))
    }
}

/// `LoggingSteps.logMessage(message, level)`; returns the message.
struct LogMessage;

#[async_trait]
impl StepFunction for LogMessage {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "LoggingSteps",
            "logMessage",
            vec![
                ArgSpec::new("message").required(),
                ArgSpec::new("level")
                    .of_kind(ValueKind::String)
                    .with_default(Value::String("info".into())),
            ],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        let message = args.get("message").cloned().unwrap_or(Value::None);
        let rendered = message.to_display_string();
        match args.get("level").and_then(Value::as_str) {
            Some("error") => tracing::error!("{rendered}"),
            Some("warn") => tracing::warn!("{rendered}"),
            Some("debug") => tracing::debug!("{rendered}"),
            _ => tracing::info!("{rendered}"),
        }
        Ok(StepOutcome::Value(message))
    }
}

/// `FlowSteps.pause(message)` — structured pause from configuration.
struct PauseFlow;

#[async_trait]
impl StepFunction for PauseFlow {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "FlowSteps",
            "pause",
            vec![ArgSpec::new("message").with_default(Value::String("paused".into()))],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Pause(
            args.get("message")
                .map(Value::to_display_string)
                .unwrap_or_default(),
        ))
    }
}

/// `FlowSteps.fail(message)` — structured error from configuration.
struct FailFlow;

#[async_trait]
impl StepFunction for FailFlow {
    fn signature(&self) -> StepSignature {
        StepSignature::new(
            PACKAGE,
            "FlowSteps",
            "fail",
            vec![ArgSpec::new("message").with_default(Value::String("failed".into()))],
        )
    }

    async fn invoke(
        &self,
        args: HashMap<String, Value>,
        _context: &PipelineContext,
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::Fail(
            args.get("message")
                .map(Value::to_display_string)
                .unwrap_or_default(),
        ))
    }
}

/// Register the built-in catalog into `registry`.
pub fn register_builtin_steps(registry: &mut StepRegistry) {
    registry.register(Concat);
    registry.register(ConcatWithSeparator);
    registry.register(UpperCase);
    registry.register(LogMessage);
    registry.register(PauseFlow);
    registry.register(FailFlow);
}
