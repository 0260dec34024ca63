use std::io;
use std::pin::Pin;

use anyhow::Result;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::Stream;
use tokio_util::io::StreamReader;
use tracing::warn;

const DATA_PREFIX: &str = "data:";
const END_SENTINEL: &str = "[DONE]";

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

// Typed envelope for one streamed chunk. Every field is optional; a missing
// `content` is a defined empty-delta case, not an error.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decodes an SSE chat-completion stream into text deltas.
///
/// Lines are assembled through a buffering reader, so a `data:` block split
/// across two network reads is decoded exactly once. The sequence ends at the
/// `[DONE]` sentinel or EOF, whichever comes first; nothing is yielded after
/// that even if the connection keeps delivering bytes.
pub struct DeltaDecoder {
    reader: BufReader<StreamReader<ByteStream, Bytes>>,
    line: String,
    finished: bool,
}

impl DeltaDecoder {
    pub fn new<S>(bytes: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let bytes: ByteStream = Box::pin(bytes);
        Self {
            reader: BufReader::new(StreamReader::new(bytes)),
            line: String::new(),
            finished: false,
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        use tokio_stream::StreamExt;
        Self::new(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other)),
        )
    }

    /// Next text delta, or `None` once the stream has ended. Malformed
    /// payloads are skipped; transport errors are fatal.
    pub async fn next_delta(&mut self) -> Result<Option<String>> {
        while !self.finished {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                self.finished = true;
                break;
            }

            let line = self.line.trim();
            // Blank separators and non-data fields carry no payload
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let payload = payload.trim();
            if payload == END_SENTINEL {
                self.finished = true;
                break;
            }

            match serde_json::from_str::<StreamChunk>(payload) {
                Ok(chunk) => {
                    let delta = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default();
                    if !delta.is_empty() {
                        return Ok(Some(delta));
                    }
                }
                Err(e) => warn!("Skipping malformed stream payload: {}", e),
            }
        }
        Ok(None)
    }
}

/// Encode content fragments as the wire framing the decoder consumes.
#[cfg(test)]
pub(crate) fn encode_sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": fragment}}]})
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[cfg(test)]
pub(crate) fn decoder_from_chunks(chunks: &[&str]) -> DeltaDecoder {
    let frames: Vec<io::Result<Bytes>> = chunks
        .iter()
        .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
        .collect();
    DeltaDecoder::new(tokio_stream::iter(frames))
}
