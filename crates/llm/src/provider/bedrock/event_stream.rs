//! Decoder for the AWS event-stream framing of Bedrock streaming responses.
//!
//! A message is a 12 byte prelude (total length, headers length, prelude CRC32),
//! the headers, the payload and a CRC32 over everything before it.

use std::collections::HashMap;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum FrameError {
    #[error("event-stream message length {0} out of range")]
    InvalidLength(usize),
    #[error("event-stream prelude checksum mismatch")]
    PreludeChecksum,
    #[error("event-stream message checksum mismatch")]
    MessageChecksum,
    #[error("event-stream header is malformed: {0}")]
    Header(&'static str),
    #[error("event-stream error {code}: {message}")]
    Remote { code: String, message: String },
}

#[derive(Debug)]
pub(crate) struct EventStreamMessage {
    headers: HashMap<String, String>,
    payload: Vec<u8>,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The message as a `{"<event-type>": payload}` JSON document. Exceptions are keyed
    /// by their exception type.
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        let name = match self.header(":message-type").unwrap_or("event") {
            "event" => self.header(":event-type").ok_or(FrameError::Header("missing :event-type"))?,
            "exception" => self
                .header(":exception-type")
                .ok_or(FrameError::Header("missing :exception-type"))?,
            _ => {
                return Err(FrameError::Remote {
                    code: self.header(":error-code").unwrap_or("unknown").to_string(),
                    message: self.header(":error-message").unwrap_or_default().to_string(),
                });
            }
        };

        let payload = if self.payload.is_empty() { b"{}".as_slice() } else { &self.payload };

        let mut frame = Vec::with_capacity(name.len() + payload.len() + 5);
        frame.extend_from_slice(b"{\"");
        frame.extend_from_slice(name.as_bytes());
        frame.extend_from_slice(b"\":");
        frame.extend_from_slice(payload);
        frame.push(b'}');

        Ok(frame)
    }
}

/// Buffers response bytes and yields complete messages.
#[derive(Debug, Default)]
pub(crate) struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Whether undecoded bytes remain.
    pub fn has_remaining(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn next_message(&mut self) -> Option<Result<EventStreamMessage, FrameError>> {
        if self.buffer.len() < PRELUDE_LEN {
            return None;
        }

        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;

        if !(PRELUDE_LEN + CRC_LEN..=MAX_MESSAGE_LEN).contains(&total_len)
            || PRELUDE_LEN + headers_len + CRC_LEN > total_len
        {
            self.buffer.clear();
            return Some(Err(FrameError::InvalidLength(total_len)));
        }

        if crc32fast::hash(&self.buffer[0..8]) != read_u32(&self.buffer[8..12]) {
            self.buffer.clear();
            return Some(Err(FrameError::PreludeChecksum));
        }

        if self.buffer.len() < total_len {
            return None;
        }

        let message: Vec<u8> = self.buffer.drain(..total_len).collect();
        let crc_start = total_len - CRC_LEN;

        if crc32fast::hash(&message[..crc_start]) != read_u32(&message[crc_start..]) {
            return Some(Err(FrameError::MessageChecksum));
        }

        let headers_end = PRELUDE_LEN + headers_len;

        let headers = match parse_headers(&message[PRELUDE_LEN..headers_end]) {
            Ok(headers) => headers,
            Err(e) => return Some(Err(e)),
        };

        Some(Ok(EventStreamMessage {
            headers,
            payload: message[headers_end..crc_start].to_vec(),
        }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Header values that are not strings are skipped.
fn parse_headers(mut bytes: &[u8]) -> Result<HashMap<String, String>, FrameError> {
    let mut headers = HashMap::new();

    while let Some((&name_len, rest)) = bytes.split_first() {
        let name_len = name_len as usize;

        if rest.len() < name_len + 1 {
            return Err(FrameError::Header("name truncated"));
        }

        let name = std::str::from_utf8(&rest[..name_len]).map_err(|_| FrameError::Header("name is not UTF-8"))?;
        let value_type = rest[name_len];
        let rest = &rest[name_len + 1..];

        let value_len = match value_type {
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            6 | 7 => {
                if rest.len() < 2 {
                    return Err(FrameError::Header("value length truncated"));
                }

                2 + u16::from_be_bytes([rest[0], rest[1]]) as usize
            }
            _ => return Err(FrameError::Header("unknown value type")),
        };

        if rest.len() < value_len {
            return Err(FrameError::Header("value truncated"));
        }

        if value_type == 7 {
            let value =
                std::str::from_utf8(&rest[2..value_len]).map_err(|_| FrameError::Header("value is not UTF-8"))?;

            headers.insert(name.to_string(), value.to_string());
        }

        bytes = &rest[value_len..];
    }

    Ok(headers)
}
