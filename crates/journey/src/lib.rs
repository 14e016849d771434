//! Journey orchestration for chat workflows: trigger resolution, step
//! execution with durable delays, reply handling and inbound routing.

pub mod admin;
pub mod capabilities;
pub mod engine;
pub mod evaluator;
pub mod inbound;
pub mod links;
pub mod state_machine;
pub mod trigger;

pub use admin::JourneyAdmin;
pub use capabilities::{Clock, LinkTracker, MessageSender};
pub use engine::{JourneyEngine, ReplyOutcome, ResumeOutcome, StartOutcome, StartRequest};
pub use inbound::InboundRouter;
pub use trigger::TriggerResolver;
