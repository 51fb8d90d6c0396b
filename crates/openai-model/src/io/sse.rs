use super::{Body, BodyError};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Body(BodyError),
    InvalidPayload,
}

/// Decodes `text/event-stream` framing into the `data` payload of each
/// event.
///
/// Only the `data` field matters to chat completions. `event`, `id` and
/// `retry` fields and comment lines are skipped. Multi-line data is joined
/// with `\n`. Bytes are buffered until a full line is available, so a
/// UTF-8 sequence split across chunks is fine.
pub struct SseDecoder {
    body: Body,
    buf: Vec<u8>,
    data_lines: Vec<String>,
    eof: bool,
}

impl SseDecoder {
    #[inline]
    pub fn new(body: Body) -> Self {
        Self {
            body,
            buf: Vec::new(),
            data_lines: Vec::new(),
            eof: false,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            while let Some(line) = self.take_line()? {
                if let Some(data) = self.feed_line(&line) {
                    return Ok(Some(data));
                }
            }

            if self.eof {
                // An event without its terminating blank line is dropped.
                return Ok(None);
            }
            match self.body.next_chunk().await.map_err(Error::Body)? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.eof = true,
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<String>, Error> {
        let Some(lf_idx) = self.buf.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.buf.drain(..=lf_idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| Error::InvalidPayload)
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            let data = self.data_lines.join("\n");
            self.data_lines.clear();
            return Some(data);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => {
                (field, value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_owned());
        } else {
            trace!("ignoring sse field `{field}`");
        }
        None
    }
}
