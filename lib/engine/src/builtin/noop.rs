use crate::component::{Component, ExecutionContext};
use crate::error::ComponentError;
use async_trait::async_trait;
use conveyor_workflow::DEFAULT_CHANNEL;

/// Passes its input through unchanged.
pub struct Noop;

#[async_trait]
impl Component for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), ComponentError> {
        let input = ctx.input().clone();
        ctx.emit(DEFAULT_CHANNEL, "noop", vec![input])
    }
}
