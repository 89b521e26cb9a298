//! Per-frame gzip compression codec.
//!
//! A plain frame is a WebSocket Text message carrying the wire JSON. A
//! compressed frame is a Binary message whose payload is the gzip of that
//! JSON. The server accepts either shape on every frame and mirrors the
//! call-open frame's encoding for everything it sends on that call; the
//! client compresses every call by default.

use anyhow::{bail, Result};
use tokio_tungstenite::tungstenite::Message;

/// Encode wire text as a WebSocket message.
pub fn encode(text: String, compress: bool) -> Result<Message> {
    if compress {
        Ok(Message::Binary(gzip_compress(text.as_bytes())?))
    } else {
        Ok(Message::Text(text))
    }
}

/// Decode a WebSocket message back to wire text. Returns the text and
/// whether the frame was compressed. Non-payload messages (ping/pong/close)
/// are the caller's concern and must not be passed here.
pub fn decode(msg: Message) -> Result<(String, bool)> {
    match msg {
        Message::Text(text) => Ok((text, false)),
        Message::Binary(bytes) => {
            let raw = gzip_decompress(&bytes)?;
            Ok((String::from_utf8(raw)?, true))
        }
        other => bail!("unexpected websocket message type: {other:?}"),
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
