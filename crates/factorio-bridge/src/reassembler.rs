//! Response reassembly from fragmented reads
//!
//! A response is a stream of JSON documents spread over any number of
//! packet bodies. Bytes are buffered until the stream holds a complete
//! document; a parser end-of-input means more fragments follow. A complete
//! document marked `"truncated": true` is a page of a larger response, and
//! the first unmarked document ends it. Anything else that fails to parse
//! is malformed and the buffer is discarded.

use agent_bridge_core::{BridgeError, ErrorCode, Response, Result, Status};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Default cap on buffered bytes for one response
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Outcome of feeding bytes to the reassembler
#[derive(Debug)]
pub enum Ingest {
    /// More fragments are needed
    Incomplete,
    /// The response is complete; the reassembler is ready for the next one
    Complete(Response),
}

/// One JSON document as the mod prints it
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    status: Status,
    #[serde(default)]
    code: Option<ErrorCode>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tick: Option<u64>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Incremental accumulator scoped to one in-flight request
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already parsed into `pages`
    consumed: usize,
    pages: Vec<WireEnvelope>,
    max_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_RESPONSE_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            consumed: 0,
            pages: Vec::new(),
            max_bytes,
        }
    }

    /// Whether no partial response is buffered
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.pages.is_empty()
    }

    /// Bytes buffered for the current response
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial response
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.pages.clear();
    }

    /// Feed one fragment
    pub fn ingest(&mut self, fragment: &[u8]) -> Result<Ingest> {
        if fragment.is_empty() && self.is_idle() {
            return Err(BridgeError::MalformedResponse(
                "empty response body".to_string(),
            ));
        }

        if self.buffer.len() + fragment.len() > self.max_bytes {
            let total = self.buffer.len() + fragment.len();
            self.reset();
            return Err(BridgeError::MalformedResponse(format!(
                "response exceeds {} bytes ({} buffered)",
                self.max_bytes, total
            )));
        }

        self.buffer.extend_from_slice(fragment);

        loop {
            let rest = &self.buffer[self.consumed..];
            let mut documents = serde_json::Deserializer::from_slice(rest).into_iter::<WireEnvelope>();

            match documents.next() {
                // Only whitespace so far
                None => return Ok(Ingest::Incomplete),
                Some(Err(e)) if e.is_eof() => return Ok(Ingest::Incomplete),
                Some(Err(e)) => {
                    self.reset();
                    return Err(BridgeError::MalformedResponse(e.to_string()));
                }
                Some(Ok(envelope)) => {
                    self.consumed += documents.byte_offset();

                    if envelope.truncated {
                        debug!(
                            "Response page {} complete, awaiting more",
                            self.pages.len() + 1
                        );
                        self.pages.push(envelope);
                        continue;
                    }

                    let trailing = &self.buffer[self.consumed..];
                    if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                        let len = trailing.len();
                        self.reset();
                        return Err(BridgeError::MalformedResponse(format!(
                            "{} unexpected bytes after final document",
                            len
                        )));
                    }

                    self.pages.push(envelope);
                    let pages = std::mem::take(&mut self.pages);
                    self.reset();
                    return merge_pages(pages).map(Ingest::Complete);
                }
            }
        }
    }
}

/// Join the pages of one response in arrival order
fn merge_pages(pages: Vec<WireEnvelope>) -> Result<Response> {
    let mut status = Status::Success;
    let mut code = None;
    let mut message = None;
    let mut tick: Option<u64> = None;
    let mut data = Map::new();

    for page in pages {
        if page.status == Status::Error && status == Status::Success {
            status = Status::Error;
            code = page.code;
            message = page.message.clone();
        } else if status == Status::Success && page.message.is_some() {
            message = page.message.clone();
        }
        if page.tick.is_some() {
            tick = tick.max(page.tick);
        }
        for (key, value) in page.data {
            match (data.get_mut(&key), value) {
                (Some(Value::Array(existing)), Value::Array(more)) => existing.extend(more),
                (_, value) => {
                    data.insert(key, value);
                }
            }
        }
    }

    Response::from_wire(status, code, message, tick, data)
}
