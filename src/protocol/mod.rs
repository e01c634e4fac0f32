//! Wire protocol types for both sides of the gateway.
//!
//! `anthropic` holds the downstream (client-facing) Messages API shapes,
//! `openai` the upstream Responses API shapes. Everything that is a closed
//! union on the wire is a `#[serde(tag = "type")]` enum here.

pub mod anthropic;
pub mod openai;
