use crate::component::{Component, ExecutionContext, Processing};
use crate::configuration::Configuration;
use crate::error::ComponentError;
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

const APPROVED: &str = "approved";
const REJECTED: &str = "rejected";

/// Holds an event until someone approves or rejects it.
///
/// Resumed with the `approve` or `reject` action; emits the original input
/// and the action parameters on `approved` or `rejected`.
pub struct Approval;

#[async_trait]
impl Component for Approval {
    fn name(&self) -> &str {
        "approval"
    }

    fn output_channels(&self, _config: &Configuration) -> Vec<String> {
        vec![APPROVED.to_string(), REJECTED.to_string()]
    }

    async fn process_queue_item(
        &self,
        _ctx: &ExecutionContext,
    ) -> Result<Processing, ComponentError> {
        Ok(Processing::Await)
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        ctx.suspend()
    }

    async fn handle_action(
        &self,
        ctx: &mut ExecutionContext,
        action: &str,
        parameters: &JsonValue,
    ) -> Result<(), ComponentError> {
        let channel = match action {
            "approve" => APPROVED,
            "reject" => REJECTED,
            other => {
                return Err(ComponentError::UnsupportedAction {
                    action: other.to_string(),
                });
            }
        };
        let payload = json!({
            "input": ctx.input(),
            "parameters": parameters,
        });
        ctx.emit(channel, &format!("approval.{channel}"), vec![payload])
    }
}
