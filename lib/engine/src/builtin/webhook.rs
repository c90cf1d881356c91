//! Generic webhook trigger.
//!
//! Configuration:
//!
//! - `resource`: ID of the external resource to register a webhook on. When
//!   set, setup asks the provisioner for a webhook and records the ID; a later
//!   setup with the same ID does nothing.
//! - `secret`: shared secret expected in the `x-webhook-secret` header.
//! - `eventType`: type tag for emitted events (default `webhook`).
//! - `filter`: `{field, predicates}` applied to the parsed body.

use crate::component::{SetupContext, Trigger, WebhookContext};
use crate::configuration::{ConfigField, ConfigSchema, FieldKind};
use crate::error::ComponentError;
use async_trait::async_trait;
use conveyor_workflow::{DEFAULT_CHANNEL, Filter};
use serde_json::{Value as JsonValue, json};
use tracing::debug;

const SECRET_HEADER: &str = "x-webhook-secret";

/// Emits the JSON body of inbound requests.
pub struct WebhookTrigger;

fn recorded_resource(metadata: Option<&JsonValue>) -> Option<&str> {
    metadata?.get("resource")?.as_str()
}

#[async_trait]
impl Trigger for WebhookTrigger {
    fn name(&self) -> &str {
        "webhook"
    }

    fn configuration(&self) -> ConfigSchema {
        ConfigSchema::new()
            .field(ConfigField::optional("resource", FieldKind::String))
            .field(ConfigField::optional("secret", FieldKind::String))
            .field(ConfigField::optional("eventType", FieldKind::String).with_default(json!("webhook")))
            .field(ConfigField::optional("filter", FieldKind::Object))
    }

    async fn setup(&self, ctx: &mut SetupContext) -> Result<(), ComponentError> {
        if let Some(filter) = ctx.configuration().get("filter") {
            let filter: Filter = serde_json::from_value(filter.clone())
                .map_err(|e| ComponentError::invalid_configuration(e.to_string()))?;
            filter
                .validate()
                .map_err(|e| ComponentError::invalid_configuration(e.to_string()))?;
        }

        let Some(resource) = ctx.configuration().get_str("resource").map(str::to_string) else {
            return Ok(());
        };

        if recorded_resource(ctx.metadata()) == Some(resource.as_str()) {
            debug!(resource = %resource, "webhook already provisioned");
            return Ok(());
        }

        ctx.request_webhook(json!({ "resource": resource }));
        ctx.set_metadata(json!({ "resource": resource }));
        Ok(())
    }

    async fn handle_webhook(&self, ctx: &mut WebhookContext) -> Result<u16, ComponentError> {
        if let Some(secret) = ctx.configuration().get_str("secret") {
            if ctx.request().header(SECRET_HEADER) != Some(secret) {
                return Ok(403);
            }
        }

        let Ok(body) = ctx.request().json() else {
            return Ok(400);
        };

        if let Some(filter) = ctx.configuration().get("filter") {
            let filter: Filter = serde_json::from_value(filter.clone())
                .map_err(|e| ComponentError::invalid_configuration(e.to_string()))?;
            let passes = filter
                .evaluate(&body)
                .map_err(|e| ComponentError::invalid_configuration(e.to_string()))?;
            if !passes {
                return Ok(200);
            }
        }

        let event_type = ctx
            .configuration()
            .get_str("eventType")
            .unwrap_or("webhook")
            .to_string();
        ctx.emit(DEFAULT_CHANNEL, &event_type, vec![body])?;
        Ok(200)
    }

    async fn cleanup(&self, ctx: &mut SetupContext) -> Result<(), ComponentError> {
        if ctx.metadata().is_some() {
            ctx.set_metadata(JsonValue::Null);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::WebhookRequest;
    use conveyor_core::{NodeId, WorkflowId};

    fn setup_context(config: JsonValue, metadata: Option<JsonValue>) -> SetupContext {
        let config = WebhookTrigger.configuration().validate(&config).unwrap();
        SetupContext::new(WorkflowId::new(), NodeId::new(), config, metadata)
    }

    fn webhook_context(config: JsonValue, request: WebhookRequest) -> WebhookContext {
        let config = WebhookTrigger.configuration().validate(&config).unwrap();
        WebhookContext::new(
            WorkflowId::new(),
            NodeId::new(),
            config,
            None,
            request,
            vec![DEFAULT_CHANNEL.to_string()],
        )
    }

    #[tokio::test]
    async fn setup_requests_webhook_once_per_resource() {
        let mut ctx = setup_context(json!({"resource": "repo-42"}), None);
        WebhookTrigger.setup(&mut ctx).await.unwrap();
        assert_eq!(ctx.webhooks().len(), 1);
        assert_eq!(ctx.changed_metadata(), Some(&json!({"resource": "repo-42"})));

        let mut again = setup_context(json!({"resource": "repo-42"}), Some(json!({"resource": "repo-42"})));
        WebhookTrigger.setup(&mut again).await.unwrap();
        assert!(again.webhooks().is_empty());
        assert!(again.changed_metadata().is_none());
    }

    #[tokio::test]
    async fn setup_reprovisions_when_resource_changes() {
        let mut ctx = setup_context(json!({"resource": "repo-43"}), Some(json!({"resource": "repo-42"})));
        WebhookTrigger.setup(&mut ctx).await.unwrap();
        assert_eq!(ctx.webhooks().len(), 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden() {
        let request = WebhookRequest::new(b"{}".to_vec()).with_header(SECRET_HEADER, "nope");
        let mut ctx = webhook_context(json!({"secret": "s3cret"}), request);
        assert_eq!(WebhookTrigger.handle_webhook(&mut ctx).await.unwrap(), 403);
        assert!(ctx.emissions().is_empty());
    }

    #[tokio::test]
    async fn invalid_body_is_bad_request() {
        let mut ctx = webhook_context(json!({}), WebhookRequest::new(b"<xml/>".to_vec()));
        assert_eq!(WebhookTrigger.handle_webhook(&mut ctx).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn emits_filtered_body() {
        let config = json!({
            "eventType": "push",
            "filter": {"field": "/ref", "predicates": [{"type": "equals", "value": "main"}]},
        });

        let mut ctx = webhook_context(config.clone(), WebhookRequest::new(br#"{"ref":"dev"}"#.to_vec()));
        assert_eq!(WebhookTrigger.handle_webhook(&mut ctx).await.unwrap(), 200);
        assert!(ctx.emissions().is_empty());

        let mut ctx = webhook_context(config, WebhookRequest::new(br#"{"ref":"main"}"#.to_vec()));
        assert_eq!(WebhookTrigger.handle_webhook(&mut ctx).await.unwrap(), 200);
        assert_eq!(ctx.emissions()[0].event_type, "push");
        assert_eq!(ctx.emissions()[0].payloads, vec![json!({"ref": "main"})]);
    }
}
