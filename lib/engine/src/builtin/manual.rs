use crate::component::Trigger;
use async_trait::async_trait;

/// A trigger that only fires on request.
pub struct ManualTrigger;

#[async_trait]
impl Trigger for ManualTrigger {
    fn name(&self) -> &str {
        "manual"
    }
}
