//! Core data model shared across the crate.

pub mod message;

pub use message::{Message, ModelInfo, Response, Role, ToolArgs, ToolCall, ToolDef};
