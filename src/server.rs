use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::broker::Broker;
use crate::mcp::McpHandler;
use crate::model::ProxyRequest;
use crate::store::PolicyStore;

// Requests larger than this are rejected outright; the broker fronts JSON
// control messages, not uploads.
const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

struct RawRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

enum ParseError {
    Malformed(String),
    TooLarge,
}

/// Loopback-only HTTP listener. The socket binds 127.0.0.1 exclusively;
/// remote callers can never reach the broker directly.
pub fn serve(port: u16, broker: Arc<Broker>, store: Arc<PolicyStore>) -> Result<(), String> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|e| format!("failed to bind 127.0.0.1:{}: {}", port, e))?;
    eprintln!("keygate: listening on 127.0.0.1:{}", port);
    serve_on(listener, broker, store)
}

/// Accept loop over an already-bound listener. Split out so tests can bind
/// port 0 and read the assigned address before serving.
pub fn serve_on(
    listener: TcpListener,
    broker: Arc<Broker>,
    store: Arc<PolicyStore>,
) -> Result<(), String> {
    let port = listener
        .local_addr()
        .map_err(|e| e.to_string())?
        .port();

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                eprintln!("keygate: accept failed: {}", err);
                continue;
            }
        };
        let broker = broker.clone();
        let store = store.clone();
        thread::spawn(move || {
            if let Err(err) = handle_connection(stream, port, &broker, &store) {
                eprintln!("keygate: connection error: {}", err);
            }
        });
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    port: u16,
    broker: &Broker,
    store: &PolicyStore,
) -> Result<(), String> {
    let peer_host = stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(ParseError::TooLarge) => {
            return write_response(
                &mut stream,
                413,
                "application/json",
                br#"{"error":"request body too large"}"#,
                false,
            );
        }
        Err(ParseError::Malformed(message)) => {
            let body = serde_json::json!({ "error": message }).to_string();
            return write_response(&mut stream, 400, "application/json", body.as_bytes(), false);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let body = serde_json::json!({ "status": "ok", "port": port }).to_string();
            write_response(&mut stream, 200, "application/json", body.as_bytes(), false)
        }
        ("OPTIONS", "/mcp") => write_response(&mut stream, 204, "application/json", b"", true),
        ("POST", "/mcp") => {
            let message = String::from_utf8_lossy(&request.body);
            let handler = McpHandler::new(broker, store);
            match handler.handle_message(&message) {
                Some(reply) => {
                    write_response(&mut stream, 200, "application/json", reply.as_bytes(), true)
                }
                // Notifications get a transport-level ack and no body.
                None => write_response(&mut stream, 202, "application/json", b"", true),
            }
        }
        ("POST", "/proxy") => {
            let proxy_request: ProxyRequest = match serde_json::from_slice(&request.body) {
                Ok(req) => req,
                Err(err) => {
                    let body =
                        serde_json::json!({ "error": format!("invalid proxy request: {}", err) })
                            .to_string();
                    return write_response(
                        &mut stream,
                        400,
                        "application/json",
                        body.as_bytes(),
                        false,
                    );
                }
            };
            // Broker outcomes ride inside the envelope; the transport status
            // is 200 even for denials so callers always get the JSON shape.
            let response = broker.handle(&proxy_request, &peer_host);
            let body = serde_json::to_string(&response).map_err(|e| e.to_string())?;
            write_response(&mut stream, 200, "application/json", body.as_bytes(), false)
        }
        _ => {
            let body = serde_json::json!({ "error": "not found" }).to_string();
            write_response(&mut stream, 404, "application/json", body.as_bytes(), false)
        }
    }
}

/// Hand-rolled HTTP/1.1 request reader: accumulate until the header
/// boundary, then honor Content-Length exactly. Without Content-Length the
/// body is whatever arrived alongside the headers; we return as soon as the
/// boundary is seen rather than waiting for EOF on a keep-alive socket.
fn read_request<R: Read>(stream: &mut R) -> Result<RawRequest, ParseError> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    let boundary = loop {
        if let Some(pos) = find_boundary(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(ParseError::TooLarge);
        }
        let n = stream
            .read(&mut chunk)
            .map_err(|e| ParseError::Malformed(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(ParseError::Malformed(
                "connection closed before headers completed".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..boundary]).to_string();
    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| ParseError::Malformed("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ParseError::Malformed("missing method".to_string()))?
        .to_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| ParseError::Malformed("missing request target".to_string()))?;
    // Route on the path only; a query string is tolerated and ignored.
    let path = target.split('?').next().unwrap_or(target).to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .next()
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| ParseError::Malformed("invalid content-length".to_string()))
        })
        .transpose()?;

    let body_start = boundary + 4;
    let body = match content_length {
        Some(length) => {
            if length > MAX_REQUEST_BYTES {
                return Err(ParseError::TooLarge);
            }
            while buf.len() < body_start + length {
                let n = stream
                    .read(&mut chunk)
                    .map_err(|e| ParseError::Malformed(format!("read failed: {}", e)))?;
                if n == 0 {
                    return Err(ParseError::Malformed(
                        "connection closed mid-body".to_string(),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            buf[body_start..body_start + length].to_vec()
        }
        // Absent Content-Length: take the bytes already buffered past the
        // boundary instead of blocking for more.
        None => buf[body_start..].to_vec(),
    };

    Ok(RawRequest { method, path, body })
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn write_response(
    stream: &mut impl Write,
    status: u16,
    content_type: &str,
    body: &[u8],
    cors: bool,
) -> Result<(), String> {
    let reason = match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        _ => "OK",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    if cors {
        head.push_str("Access-Control-Allow-Origin: *\r\n");
        head.push_str("Access-Control-Allow-Methods: POST, OPTIONS\r\n");
        head.push_str("Access-Control-Allow-Headers: Content-Type\r\n");
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .and_then(|_| stream.write_all(body))
        .map_err(|e| e.to_string())
}
