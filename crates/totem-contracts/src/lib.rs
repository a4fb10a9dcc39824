//! Data model and pure logic shared across the totem workspace: the error
//! taxonomy and classification rules, the chat transcript discipline, the
//! workflow phase machine, engine configuration, and the session event log.

pub mod chat;
pub mod config;
pub mod errors;
pub mod events;
pub mod workflow;
