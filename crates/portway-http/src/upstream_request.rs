use http::Uri;

use crate::ParsedRequest;

/// Serializes `request` for the upstream origin.
///
/// Absolute-form targets are rewritten to origin-form; origin-form
/// targets pass through verbatim. Headers are emitted in stored order
/// with canonical `Capitalized-Name` casing, followed by a blank line
/// and the body.
pub(crate) fn serialize(request: &ParsedRequest) -> Vec<u8> {
    let target = rewrite_target_for_upstream(&request.target);

    let mut out = Vec::with_capacity(128 + request.body.len());
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.version.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in &request.headers {
        out.extend_from_slice(capitalize_header_name(name).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

fn rewrite_target_for_upstream(target: &str) -> String {
    if !(target.starts_with("http://") || target.starts_with("https://")) {
        return target.to_string();
    }
    // An unparseable absolute target is forwarded as received.
    let Ok(uri) = target.parse::<Uri>() else {
        return target.to_string();
    };
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// `content-type` becomes `Content-Type`: split on `-`, uppercase the
/// first byte of each segment, lowercase the rest.
fn capitalize_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (index, segment) in name.split('-').enumerate() {
        if index > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}
