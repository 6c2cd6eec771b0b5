// Per-connection orchestration. Compiled into lib.rs; shares its
// imports.

async fn handle_connection(shared: Arc<SharedState>, stream: TcpStream) {
    let (client_ip, client_port) = match stream.peer_addr() {
        Ok(addr) => (addr.ip().to_string(), addr.port()),
        Err(_) => ("unknown".to_string(), 0),
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match timeout(CLIENT_READ_TIMEOUT, parse_request(&mut reader)).await {
        Ok(Ok(request)) => request,
        Ok(Err(error)) => {
            send_error_response(&mut write_half, 400, "Bad Request").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                "",
                0,
                "UNKNOWN",
                "",
                AccessAction::Error,
                400,
                0,
                0,
                &error.to_string(),
            );
            return;
        }
        Err(_elapsed) => {
            send_error_response(&mut write_half, 400, "Bad Request").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                "",
                0,
                "UNKNOWN",
                "",
                AccessAction::Error,
                400,
                0,
                0,
                "client read timed out",
            );
            return;
        }
    };

    if !shared.config.authentication_token.is_empty() {
        let presented = request.header("proxy-authorization").unwrap_or("");
        if presented != shared.config.authentication_token {
            send_error_response(&mut write_half, 407, "Proxy Authentication Required").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::AuthFailed,
                407,
                0,
                0,
                "",
            );
            return;
        }
    }

    if request.is_connect {
        if !shared.config.enable_connect_tunneling {
            send_error_response(&mut write_half, 501, "Not Implemented").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Blocked,
                501,
                0,
                0,
                "CONNECT not enabled",
            );
            return;
        }

        if let Some(rule) = shared.filter.is_blocked(&request.host) {
            send_error_response(&mut write_half, 403, "Forbidden").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Blocked,
                403,
                0,
                0,
                &rule,
            );
            return;
        }

        // CONNECT parsing stops at the request line; the rest of the
        // head must be consumed before the splice, or it would leak
        // into the tunnel.
        let drained = match timeout(CLIENT_READ_TIMEOUT, drain_header_lines(&mut reader)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client read timed out",
            )),
        };
        if let Err(error) = drained {
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Error,
                0,
                0,
                0,
                &error.to_string(),
            );
            return;
        }

        match forwarder::handle_connect(&request, reader, write_half).await {
            Ok(()) => log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Allowed,
                200,
                0,
                0,
                "",
            ),
            Err(error) => log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Error,
                0,
                0,
                0,
                &error.to_string(),
            ),
        }
        return;
    }

    if let Some(rule) = shared.filter.is_blocked(&request.host) {
        send_error_response(&mut write_half, 403, "Forbidden").await;
        log_request(
            &shared,
            &client_ip,
            client_port,
            &request.host,
            request.port,
            &request.method,
            &request.target,
            AccessAction::Blocked,
            403,
            0,
            0,
            &rule,
        );
        return;
    }

    let cache_key = make_key(&request.method, &request.target);
    if let (Some(cache), Some(key)) = (shared.cache.as_ref(), cache_key.as_deref()) {
        if let Some(entry) = cache.get(key) {
            let status = entry.status_code;
            let body_len = entry.body.len() as u64;
            serve_cached_response(&mut write_half, &entry).await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::CacheHit,
                status,
                0,
                body_len,
                "",
            );
            return;
        }
    }

    let capture = shared.cache.is_some() && cache_key.is_some();
    match forwarder::forward_request(&request, &mut write_half, capture).await {
        Ok(outcome) => {
            if let (Some(cache), Some(key)) = (shared.cache.as_ref(), cache_key.as_deref()) {
                if is_cacheable(&request.method, outcome.status_code) {
                    if let Some(captured) = outcome.captured {
                        cache.put(key, captured);
                    }
                }
            }
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Allowed,
                outcome.status_code,
                outcome.bytes_upstream,
                outcome.bytes_downstream,
                "",
            );
        }
        Err(error) => {
            send_error_response(&mut write_half, 502, "Bad Gateway").await;
            log_request(
                &shared,
                &client_ip,
                client_port,
                &request.host,
                request.port,
                &request.method,
                &request.target,
                AccessAction::Error,
                502,
                error.bytes_upstream(),
                error.bytes_downstream(),
                &error.to_string(),
            );
        }
    }
}

async fn drain_header_lines<R>(reader: &mut R) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

async fn send_error_response(client: &mut OwnedWriteHalf, status_code: u16, reason: &str) {
    let body = format!("{status_code} {reason}");
    let response = format!(
        "HTTP/1.1 {status_code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    // The connection is closing either way; a failed error write is
    // not reported anywhere else.
    let _ = client.write_all(response.as_bytes()).await;
}

async fn serve_cached_response(client: &mut OwnedWriteHalf, entry: &CacheEntry) {
    let mut response = Vec::with_capacity(128 + entry.body.len());
    response.extend_from_slice(format!("HTTP/1.1 {} OK\r\n", entry.status_code).as_bytes());
    for (name, value) in &entry.headers {
        response.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(&entry.body);
    let _ = client.write_all(&response).await;
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    shared: &SharedState,
    client_ip: &str,
    client_port: u16,
    dest_host: &str,
    dest_port: u16,
    method: &str,
    target: &str,
    action: AccessAction,
    upstream_status: u16,
    bytes_upstream: u64,
    bytes_downstream: u64,
    blocked_rule: &str,
) {
    shared.logger.log(&AccessRecord {
        timestamp: Utc::now(),
        client_ip: client_ip.to_string(),
        client_port,
        dest_host: dest_host.to_string(),
        dest_port,
        method: method.to_string(),
        target: target.to_string(),
        action,
        upstream_status,
        bytes_upstream,
        bytes_downstream,
        blocked_rule: blocked_rule.to_string(),
    });
}
