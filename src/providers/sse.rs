// Server-sent events reader shared by the streaming chat providers

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{GatewayError, Result};

/// Yield the payload of every `data:` line until `[DONE]` or end of stream.
///
/// Lines are split on raw bytes so multi-byte characters straddling two
/// network chunks are decoded intact.
pub fn data_lines<S, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<GatewayError> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(Into::<GatewayError>::into(e));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Some(Line::Done) => return,
                    Some(Line::Data(data)) => yield Ok(data),
                    None => {}
                }
            }
        }

        if let Some(Line::Data(data)) = parse_line(&buffer) {
            yield Ok(data);
        }
    }
}

enum Line {
    Data(String),
    Done,
}

fn parse_line(raw: &[u8]) -> Option<Line> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Line::Done);
    }
    Some(Line::Data(data.to_string()))
}
