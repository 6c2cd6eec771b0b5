use http::uri::Authority;
use http::Uri;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{ParseError, ParsedRequest, MAX_REQUEST_BODY_BYTES};

/// Parses one HTTP/1.1 request from `reader`.
///
/// CONNECT requests short-circuit after the request line: the target is
/// taken as `host:port` and neither headers nor body are consumed.
pub async fn parse_request<R>(reader: &mut R) -> Result<ParsedRequest, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = read_trimmed_line(reader).await?;
    let mut parts = request_line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (
            method.to_ascii_uppercase(),
            target.to_string(),
            version.to_string(),
        ),
        _ => return Err(ParseError::InvalidRequestLine(request_line)),
    };

    if method == "CONNECT" {
        let (host, port) = split_connect_target(&target)?;
        return Ok(ParsedRequest {
            method,
            target,
            version,
            headers: Vec::new(),
            body: Vec::new(),
            host,
            port,
            is_connect: true,
        });
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = read_trimmed_line(reader).await?;
        if line.is_empty() {
            break;
        }
        // Lines without a colon are skipped, not fatal.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        match headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => headers.push((name, value)),
        }
    }

    let (host, port) = resolve_destination(&target, &headers)?;
    let body = read_body(reader, &headers).await?;

    Ok(ParsedRequest {
        method,
        target,
        version,
        headers,
        body,
        host,
        port,
        is_connect: false,
    })
}

async fn read_trimmed_line<R>(reader: &mut R) -> Result<String, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(ParseError::UnexpectedEof);
    }
    while matches!(line.last(), Some(b'\r') | Some(b'\n')) {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| ParseError::InvalidEncoding)
}

fn split_connect_target(target: &str) -> Result<(String, u16), ParseError> {
    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(ParseError::InvalidConnectTarget(target.to_string()));
    };
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let port: u16 = port
        .parse()
        .map_err(|_| ParseError::InvalidConnectTarget(target.to_string()))?;
    if host.is_empty() || port == 0 {
        return Err(ParseError::InvalidConnectTarget(target.to_string()));
    }
    Ok((host, port))
}

fn resolve_destination(
    target: &str,
    headers: &[(String, String)],
) -> Result<(String, u16), ParseError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        let uri: Uri = target
            .parse()
            .map_err(|_| ParseError::InvalidAbsoluteUri(target.to_string()))?;
        let host = uri
            .host()
            .ok_or_else(|| ParseError::InvalidAbsoluteUri(target.to_string()))?
            .to_ascii_lowercase();
        let default_port = if target.starts_with("https://") { 443 } else { 80 };
        return Ok((host, uri.port_u16().unwrap_or(default_port)));
    }

    let host_header = headers
        .iter()
        .find(|(name, _)| name == "host")
        .map(|(_, value)| value.as_str())
        .ok_or(ParseError::MissingHostHeader)?;
    let authority: Authority = host_header
        .parse()
        .map_err(|_| ParseError::InvalidHostHeader(host_header.to_string()))?;
    Ok((
        authority.host().to_ascii_lowercase(),
        authority.port_u16().unwrap_or(80),
    ))
}

async fn read_body<R>(
    reader: &mut R,
    headers: &[(String, String)],
) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(raw_length) = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| value.as_str())
    else {
        return Ok(Vec::new());
    };

    let length: usize = raw_length
        .parse()
        .map_err(|_| ParseError::InvalidContentLength(raw_length.to_string()))?;
    if length > MAX_REQUEST_BODY_BYTES {
        return Err(ParseError::BodyTooLarge(length));
    }

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
