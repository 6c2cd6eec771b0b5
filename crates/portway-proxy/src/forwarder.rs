//! Upstream data path: dial, request relay, streaming response copy,
//! and the bidirectional CONNECT splice.
//!
//! Every read and write against either peer runs under the 30-second
//! upstream deadline; a timeout surfaces as an I/O error and tears the
//! connection down. Byte counters track exactly what went over each
//! wire, partial writes included.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use portway_core::cache::CacheEntry;
use portway_http::ParsedRequest;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Bodies above this size stream through without being retained for
/// the cache.
const MAX_CAPTURED_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum ForwardError {
    #[error("upstream unreachable: {source}")]
    Unreachable { source: io::Error },
    #[error("upstream relay failed: {source}")]
    Relay {
        source: io::Error,
        bytes_upstream: u64,
        bytes_downstream: u64,
    },
}

impl ForwardError {
    pub(crate) fn bytes_upstream(&self) -> u64 {
        match self {
            Self::Unreachable { .. } => 0,
            Self::Relay { bytes_upstream, .. } => *bytes_upstream,
        }
    }

    pub(crate) fn bytes_downstream(&self) -> u64 {
        match self {
            Self::Unreachable { .. } => 0,
            Self::Relay {
                bytes_downstream, ..
            } => *bytes_downstream,
        }
    }
}

pub(crate) struct ForwardOutcome {
    pub(crate) status_code: u16,
    pub(crate) bytes_upstream: u64,
    pub(crate) bytes_downstream: u64,
    /// Present when `capture` was requested and the whole response fit
    /// under the capture cap.
    pub(crate) captured: Option<CacheEntry>,
}

async fn dial_upstream(host: &str, port: u16) -> io::Result<TcpStream> {
    match timeout(UPSTREAM_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream connect timed out",
        )),
    }
}

/// Relays `request` to its resolved destination and streams the
/// response back to `client`, byte for byte.
pub(crate) async fn forward_request(
    request: &ParsedRequest,
    client: &mut OwnedWriteHalf,
    capture: bool,
) -> Result<ForwardOutcome, ForwardError> {
    let upstream = dial_upstream(&request.host, request.port)
        .await
        .map_err(|source| ForwardError::Unreachable { source })?;
    let (upstream_read, mut upstream_write) = upstream.into_split();

    let request_bytes = request.serialize_for_upstream();
    let mut bytes_upstream = 0_u64;
    write_all_counted(&mut upstream_write, &request_bytes, &mut bytes_upstream)
        .await
        .map_err(|source| ForwardError::Relay {
            source,
            bytes_upstream,
            bytes_downstream: 0,
        })?;

    relay_response(upstream_read, client, capture, bytes_upstream).await
}

async fn relay_response(
    upstream_read: OwnedReadHalf,
    client: &mut OwnedWriteHalf,
    capture: bool,
    bytes_upstream: u64,
) -> Result<ForwardOutcome, ForwardError> {
    let mut reader = BufReader::new(upstream_read);
    let mut bytes_downstream = 0_u64;

    // Status line: forwarded verbatim, status parsed best-effort.
    let status_line = read_wire_line(&mut reader)
        .await
        .map_err(|source| ForwardError::Relay {
            source,
            bytes_upstream,
            bytes_downstream,
        })?;
    let status_code = parse_status_code(&status_line);
    write_all_counted(client, &status_line, &mut bytes_downstream)
        .await
        .map_err(|source| ForwardError::Relay {
            source,
            bytes_upstream,
            bytes_downstream,
        })?;

    // Header block: each line forwarded as read, including terminators.
    let mut captured_headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = read_wire_line(&mut reader)
            .await
            .map_err(|source| ForwardError::Relay {
                source,
                bytes_upstream,
                bytes_downstream,
            })?;
        write_all_counted(client, &line, &mut bytes_downstream)
            .await
            .map_err(|source| ForwardError::Relay {
                source,
                bytes_upstream,
                bytes_downstream,
            })?;
        if line == b"\r\n" || line == b"\n" {
            break;
        }
        if capture {
            if let Some(header) = split_header_line(&line) {
                captured_headers.push(header);
            }
        }
    }

    // Body: stream until EOF in fixed-size chunks.
    let mut captured_body: Option<Vec<u8>> = if capture { Some(Vec::new()) } else { None };
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = read_with_timeout(&mut reader, &mut chunk)
            .await
            .map_err(|source| ForwardError::Relay {
                source,
                bytes_upstream,
                bytes_downstream,
            })?;
        if read == 0 {
            break;
        }
        write_all_counted(client, &chunk[..read], &mut bytes_downstream)
            .await
            .map_err(|source| ForwardError::Relay {
                source,
                bytes_upstream,
                bytes_downstream,
            })?;

        let overflowed = captured_body
            .as_ref()
            .is_some_and(|body| body.len() + read > MAX_CAPTURED_BODY_BYTES);
        if overflowed {
            captured_body = None;
        } else if let Some(body) = captured_body.as_mut() {
            body.extend_from_slice(&chunk[..read]);
        }
    }

    let captured = captured_body.map(|body| CacheEntry {
        status_code,
        headers: captured_headers,
        body,
    });
    Ok(ForwardOutcome {
        status_code,
        bytes_upstream,
        bytes_downstream,
        captured,
    })
}

/// Dials the CONNECT destination, acknowledges the tunnel, and splices
/// bytes both ways until either direction finishes.
pub(crate) async fn handle_connect(
    request: &ParsedRequest,
    mut client_read: BufReader<OwnedReadHalf>,
    mut client_write: OwnedWriteHalf,
) -> Result<(), ForwardError> {
    let upstream = match dial_upstream(&request.host, request.port).await {
        Ok(stream) => stream,
        Err(source) => {
            let _ = client_write
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                .await;
            return Err(ForwardError::Unreachable { source });
        }
    };

    client_write
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|source| ForwardError::Relay {
            source,
            bytes_upstream: 0,
            bytes_downstream: 0,
        })?;

    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let result = tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => result,
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => result,
    };
    // Dropping both halves closes both connections.
    match result {
        Ok(_bytes) => Ok(()),
        Err(source) => Err(ForwardError::Relay {
            source,
            bytes_upstream: 0,
            bytes_downstream: 0,
        }),
    }
}

async fn read_wire_line<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = match timeout(UPSTREAM_TIMEOUT, reader.read_until(b'\n', &mut line)).await {
        Ok(result) => result?,
        Err(_elapsed) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream read timed out",
            ))
        }
    };
    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed before the response head was complete",
        ));
    }
    Ok(line)
}

async fn read_with_timeout<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match timeout(UPSTREAM_TIMEOUT, reader.read(buf)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream read timed out",
        )),
    }
}

async fn write_all_counted<W>(writer: &mut W, data: &[u8], written: &mut u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    while offset < data.len() {
        let wrote = match timeout(UPSTREAM_TIMEOUT, writer.write(&data[offset..])).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
            }
        };
        if wrote == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer refused further writes",
            ));
        }
        offset += wrote;
        *written += wrote as u64;
    }
    Ok(())
}

fn parse_status_code(status_line: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(status_line);
    text.split_whitespace()
        .nth(1)
        .and_then(|token| token.parse().ok())
        .unwrap_or(0)
}

fn split_header_line(line: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::{parse_status_code, split_header_line};

    #[test]
    fn status_code_is_the_second_token() {
        assert_eq!(parse_status_code(b"HTTP/1.1 200 OK\r\n"), 200);
        assert_eq!(parse_status_code(b"HTTP/1.1 404 Not Found\r\n"), 404);
    }

    #[test]
    fn unparseable_status_records_zero() {
        assert_eq!(parse_status_code(b"HTTP/1.1\r\n"), 0);
        assert_eq!(parse_status_code(b"HTTP/1.1 abc OK\r\n"), 0);
        assert_eq!(parse_status_code(b"\r\n"), 0);
    }

    #[test]
    fn header_lines_split_on_the_first_colon() {
        assert_eq!(
            split_header_line(b"Content-Type: text/plain\r\n"),
            Some(("Content-Type".to_string(), "text/plain".to_string()))
        );
        assert_eq!(
            split_header_line(b"Date: Sun, 02 Aug 2026 00:00:00 GMT\r\n"),
            Some((
                "Date".to_string(),
                "Sun, 02 Aug 2026 00:00:00 GMT".to_string()
            ))
        );
        assert_eq!(split_header_line(b"no colon here\r\n"), None);
    }
}
