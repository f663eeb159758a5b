//! Pipeline orchestration.
//!
//! The [`Orchestrator`] walks a privacy request through its checkpoints,
//! creating tasks per action and running them on a bounded worker. Pre- and
//! post-execution webhooks go through a [`WebhookClient`].

mod orchestrator;
mod webhooks;


pub use orchestrator::{Orchestrator, StepResult};
#[cfg(feature = "http")]
pub use webhooks::HttpWebhookClient;
pub use webhooks::{Webhook, WebhookClient, WebhookDirection, WebhookPayload, WebhookResponse};
