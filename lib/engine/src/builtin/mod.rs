//! Built-in components and triggers.

mod approval;
mod branch;
mod manual;
mod noop;
mod webhook;

pub use approval::Approval;
pub use branch::{FilterComponent, If};
pub use manual::ManualTrigger;
pub use noop::Noop;
pub use webhook::WebhookTrigger;
