//! The leadflow gateway: webhook intake, the conversation orchestrator,
//! the follow-up runner, outbound dispatch, and the operator WebSocket
//! bus, all wired through a shared [`state::AppState`].

pub mod api;
pub mod cli;
pub mod runtime;
pub mod state;
