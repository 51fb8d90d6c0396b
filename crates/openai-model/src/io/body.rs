#[cfg(test)]
use std::collections::VecDeque;
use std::fmt::{self, Display};

use bytes::Bytes;
use reqwest::Response;

/// Failure while reading the response body.
#[derive(Debug, PartialEq, Eq)]
pub struct Error(pub String);

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body read failed: {}", self.0)
    }
}

/// Where the raw bytes of a streamed completion come from.
pub enum Body {
    Http(Response),
    #[cfg(test)]
    Canned(VecDeque<Bytes>),
}

impl Body {
    #[cfg(test)]
    pub fn canned<I: IntoIterator<Item = &'static [u8]>>(chunks: I) -> Self {
        Body::Canned(chunks.into_iter().map(Bytes::from_static).collect())
    }

    /// Returns the next chunk, or `None` once the body is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Body::Http(response) => {
                response.chunk().await.map_err(|err| Error(err.to_string()))
            }
            #[cfg(test)]
            Body::Canned(chunks) => Ok(chunks.pop_front()),
        }
    }
}
