//! Reply lines and request headers of the two-phase upload protocol.
//!
//! The server answers a handshake with `RESOURCEID:<id>;BEFORE:<offset>` and
//! a chunk upload with `RETURN_CODE:<n>`. Only the first line of the body is
//! significant; segments are read positionally by their colon, key names are
//! not checked.

use crate::constants::{
    Action, CHARSET_UTF8, FORM_URLENCODED, HEADER_ACTION_NAME, HEADER_BEFORE, HEADER_CHARSET,
    HEADER_CONTENT_TYPE, HEADER_FILE_NAME, HEADER_FILE_SIZE, HEADER_RESOURCE_ID,
};

/// Errors produced while decoding server replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty response")]
    Empty,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("resume offset {offset} is beyond file size {total}")]
    OffsetBeyondEnd { offset: u64, total: u64 },

    #[error("unknown return code: {0}")]
    UnknownReturnCode(String),
}

/// Returns the first line of a response body without its line terminator.
pub fn first_line(body: &str) -> &str {
    body.lines().next().unwrap_or("").trim_end_matches('\r')
}

/// Value following the first `:` of a segment.
fn segment_value(segment: &str) -> Option<&str> {
    segment.find(':').map(|idx| segment[idx + 1..].trim())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Decoded handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Server-assigned identifier of the upload.
    pub resource_id: String,
    /// Number of bytes the server already holds.
    pub offset: u64,
}

impl HandshakeReply {
    /// Parses `RESOURCEID:<id>;BEFORE:<offset>`.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = first_line(line).trim();
        if line.is_empty() {
            return Err(WireError::Empty);
        }

        let mut segments = line.split(';');
        let (Some(id_segment), Some(offset_segment)) = (segments.next(), segments.next()) else {
            return Err(WireError::Malformed(line.to_string()));
        };

        let (Some(resource_id), Some(offset)) =
            (segment_value(id_segment), segment_value(offset_segment))
        else {
            return Err(WireError::Malformed(line.to_string()));
        };

        let offset = offset
            .parse::<u64>()
            .map_err(|_| WireError::Malformed(line.to_string()))?;

        Ok(Self {
            resource_id: resource_id.to_string(),
            offset,
        })
    }

    /// Parses a reply and rejects offsets past the end of a `total`-byte file.
    pub fn parse_for(line: &str, total: u64) -> Result<Self, WireError> {
        let reply = Self::parse(line)?;
        if reply.offset > total {
            return Err(WireError::OffsetBeyondEnd {
                offset: reply.offset,
                total,
            });
        }
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Chunk upload result
// ---------------------------------------------------------------------------

/// Result code of a chunk upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The whole file has been received.
    FileReceived,
    /// The chunk was accepted; more are expected.
    ChunkReceived,
}

impl ReturnCode {
    /// Parses `RETURN_CODE:<n>` (a bare `<n>` is accepted as well).
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = first_line(line).trim();
        if line.is_empty() {
            return Err(WireError::Empty);
        }
        let value = segment_value(line).unwrap_or(line);
        match value.parse::<i64>() {
            Ok(0) => Ok(ReturnCode::FileReceived),
            Ok(1) => Ok(ReturnCode::ChunkReceived),
            _ => Err(WireError::UnknownReturnCode(value.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Request headers
// ---------------------------------------------------------------------------

/// A request header as `(name, value)`.
pub type Header = (&'static str, String);

fn common_headers(action: Action) -> Vec<Header> {
    vec![
        (HEADER_CHARSET, CHARSET_UTF8.to_string()),
        (HEADER_CONTENT_TYPE, FORM_URLENCODED.to_string()),
        (HEADER_ACTION_NAME, action.as_str().to_string()),
    ]
}

/// Headers of a handshake request. An unknown resource id is sent empty.
pub fn handshake_headers(resource_id: Option<&str>, file_name: &str, file_size: u64) -> Vec<Header> {
    let mut headers = common_headers(Action::Hand);
    headers.push((HEADER_RESOURCE_ID, resource_id.unwrap_or_default().to_string()));
    headers.push((HEADER_FILE_NAME, file_name.to_string()));
    headers.push((HEADER_FILE_SIZE, file_size.to_string()));
    headers
}

/// Headers of a chunk upload starting at `offset`.
pub fn upload_headers(resource_id: &str, offset: u64) -> Vec<Header> {
    let mut headers = common_headers(Action::Upload);
    headers.push((HEADER_RESOURCE_ID, resource_id.to_string()));
    headers.push((HEADER_BEFORE, offset.to_string()));
    headers
}
