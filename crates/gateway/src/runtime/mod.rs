//! Runtime: the orchestrator and everything it leans on — per-conversation
//! lanes, context building, the follow-up ladder, outbound transport, and
//! the operator bus.

pub mod bus;
pub mod context;
pub mod followups;
pub mod lane;
pub mod orchestrator;
pub mod outbound;

pub use bus::OperatorBus;
pub use followups::FollowupRunner;
pub use lane::ConversationLaneMap;
pub use orchestrator::{InboundUserMessage, Orchestrator};
pub use outbound::{Transport, WhatsAppTransport};
