//! Predicate-driven components.
//!
//! Both read the same configuration as an edge filter:
//! `{"field": "/json/pointer", "predicates": [...]}`.

use crate::component::{Component, ExecutionContext};
use crate::configuration::{ConfigField, ConfigSchema, Configuration, FieldKind};
use crate::error::ComponentError;
use async_trait::async_trait;
use conveyor_workflow::{DEFAULT_CHANNEL, Filter};

fn filter_schema() -> ConfigSchema {
    ConfigSchema::new()
        .field(ConfigField::optional("field", FieldKind::String))
        .field(ConfigField::required("predicates", FieldKind::Array))
}

fn decode_filter(config: &Configuration) -> Result<Filter, ComponentError> {
    let filter: Filter = config.decode()?;
    filter
        .validate()
        .map_err(|e| ComponentError::invalid_configuration(e.to_string()))?;
    Ok(filter)
}

fn evaluate(ctx: &ExecutionContext) -> Result<bool, ComponentError> {
    decode_filter(ctx.configuration())?
        .evaluate(ctx.input())
        .map_err(|e| ComponentError::failed(e.to_string()))
}

/// Emits its input on `true` or `false`.
pub struct If;

#[async_trait]
impl Component for If {
    fn name(&self) -> &str {
        "if"
    }

    fn configuration(&self) -> ConfigSchema {
        filter_schema()
    }

    fn output_channels(&self, _config: &Configuration) -> Vec<String> {
        vec!["true".to_string(), "false".to_string()]
    }

    fn setup(&self, config: &Configuration) -> Result<(), ComponentError> {
        decode_filter(config).map(|_| ())
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        let channel = if evaluate(ctx)? { "true" } else { "false" };
        let input = ctx.input().clone();
        ctx.emit(channel, &format!("if.{channel}"), vec![input])
    }
}

/// Emits its input only when the filter passes.
pub struct FilterComponent;

#[async_trait]
impl Component for FilterComponent {
    fn name(&self) -> &str {
        "filter"
    }

    fn configuration(&self) -> ConfigSchema {
        filter_schema()
    }

    fn setup(&self, config: &Configuration) -> Result<(), ComponentError> {
        decode_filter(config).map(|_| ())
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        if !evaluate(ctx)? {
            return Ok(());
        }
        let input = ctx.input().clone();
        ctx.emit(DEFAULT_CHANNEL, "filter.passed", vec![input])
    }
}
