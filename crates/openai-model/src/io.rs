mod body;
mod sse;

pub use body::{Body, Error as BodyError};
pub use sse::{Error as SseError, SseDecoder};
