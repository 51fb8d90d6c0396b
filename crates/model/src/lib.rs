//! The contract between the survey agent and a chat-completion backend.
//!
//! The agent only ever talks to a model through the types in this crate:
//! it sends the conversation plus the tool catalog, and receives a stream
//! of events that is either plain text or a list of tool invocations.
//! Concrete backends live in their own crates.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
