use std::io::{BufRead, Read, Write};
use thiserror::Error;

use crate::protocol::{
    END_MARKER, LENGTH_KEY, MAX_HEAD_LEN, ProtocolError, Request, Response, parse_length,
};

/// Write one encoded frame to a writer
pub fn write_frame(writer: &mut impl Write, frame: &[u8]) -> Result<(), CodecError> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

/// Write a request to a writer
pub fn write_request(writer: &mut impl Write, req: &Request) -> Result<(), CodecError> {
    write_frame(writer, req.encode()?.as_bytes())
}

/// Read a request from a buffered reader
pub fn read_request(reader: &mut impl BufRead) -> Result<Request, CodecError> {
    let frame = read_frame(reader)?;
    Ok(Request::decode(&frame)?)
}

/// Write a response to a writer
pub fn write_response(writer: &mut impl Write, resp: &Response) -> Result<(), CodecError> {
    write_frame(writer, resp.encode()?.as_bytes())
}

/// Read a response from a buffered reader
pub fn read_response(reader: &mut impl BufRead) -> Result<Response, CodecError> {
    let frame = read_frame(reader)?;
    Ok(Response::decode(&frame)?)
}

/// Read the raw bytes of exactly one frame: head lines through `END`,
/// then as many body bytes as `LENGTH` announced.
///
/// The head may not exceed [`MAX_HEAD_LEN`] bytes and the body is capped by
/// `LENGTH` validation, so a peer cannot make the reader buffer without bound.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Vec<u8>, CodecError> {
    let mut frame = Vec::new();
    let mut body_len = 0;

    loop {
        let start = frame.len();
        let remaining = MAX_HEAD_LEN.saturating_sub(start);
        if remaining == 0 {
            return Err(ProtocolError::HeadTooLarge(MAX_HEAD_LEN).into());
        }
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut frame)?;
        if n == 0 {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                if start == 0 {
                    "connection closed"
                } else {
                    "connection closed while reading frame"
                },
            )));
        }
        // Cut off by the cap, not by a newline
        if n == remaining && !frame.ends_with(b"\n") {
            return Err(ProtocolError::HeadTooLarge(MAX_HEAD_LEN).into());
        }

        let line = trim_line(&frame[start..]);
        if line == END_MARKER.as_bytes() {
            break;
        }
        if let Some(value) = line
            .strip_prefix(LENGTH_KEY.as_bytes())
            .and_then(|rest| rest.strip_prefix(b":"))
        {
            let value = std::str::from_utf8(value).map_err(|_| ProtocolError::InvalidUtf8)?;
            body_len = parse_length(value)?;
        }
    }

    let start = frame.len();
    frame.resize(start + body_len, 0);
    reader.read_exact(&mut frame[start..])?;
    Ok(frame)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Frame transport errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
