//! HTTP/1.1 framing for RPC payloads
//!
//! Requests are POSTed with keep-alive to a path chosen from the payload
//! shape. Responses are read header block first, then exactly
//! `Content-Length` body bytes; without that header the body runs until the
//! peer stops sending within the socket read timeout.

use std::io::{self, BufRead, ErrorKind, Read, Write};

use crate::constants::http;
use crate::errors::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    XmlRpc,
    JsonRpc,
}

impl PayloadKind {
    /// Inspects the first non-whitespace byte of the payload
    pub fn detect(payload: &[u8]) -> Self {
        match payload.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => PayloadKind::JsonRpc,
            _ => PayloadKind::XmlRpc,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            PayloadKind::XmlRpc => http::XML_RPC_PATH,
            PayloadKind::JsonRpc => http::JSON_RPC_PATH,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            PayloadKind::XmlRpc => http::XML_CONTENT_TYPE,
            PayloadKind::JsonRpc => http::JSON_CONTENT_TYPE,
        }
    }
}

/// A parsed message: start line, headers in arrival order, body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpMessage {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Status code when this message is a response
    pub fn status(&self) -> Option<u16> {
        let mut parts = self.start_line.split_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse().ok()
    }

    /// Whether the stream can carry another exchange after this message.
    /// A body without a length runs to the close, and `Connection: close`
    /// says so outright.
    pub fn keeps_connection(&self) -> bool {
        let closing = self
            .header("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"));
        self.header("content-length").is_some() && !closing
    }
}

pub fn write_request<W: Write>(writer: &mut W, host: &str, payload: &[u8]) -> io::Result<()> {
    let kind = PayloadKind::detect(payload);
    let head = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         \r\n",
        kind.path(),
        host,
        http::USER_AGENT,
        kind.content_type(),
        payload.len()
    );
    writer.write_all(head.as_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads one response, skipping interim `1xx` responses
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<HttpMessage, TransportError> {
    loop {
        let message = read_message(reader)?;
        match message.status() {
            Some(status) if (100..200).contains(&status) => continue,
            Some(_) => return Ok(message),
            None => {
                return Err(TransportError::MalformedResponse {
                    reason: format!("bad status line '{}'", message.start_line),
                })
            }
        }
    }
}

/// Reads one message (request or response) off the stream
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<HttpMessage, TransportError> {
    let (start_line, headers) = read_head(reader)?;

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|e| TransportError::MalformedResponse {
                    reason: format!("bad Content-Length '{}': {}", value, e),
                })
        })
        .transpose()?;

    let body = match content_length {
        Some(length) => {
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body)?;
            body
        }
        None => read_until_idle(reader)?,
    };

    Ok(HttpMessage {
        start_line,
        headers,
        body,
    })
}

fn read_head<R: BufRead>(reader: &mut R) -> Result<(String, Vec<(String, String)>), TransportError> {
    let mut total = 0usize;
    let mut start_line: Option<String> = None;
    let mut headers = Vec::new();

    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Err(TransportError::MalformedResponse {
                reason: "connection closed before headers completed".to_string(),
            });
        }
        total += read;
        if total > http::MAX_HEADER_BYTES {
            return Err(TransportError::MalformedResponse {
                reason: "header block too large".to_string(),
            });
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);

        match start_line {
            None if text.is_empty() => continue,
            None => start_line = Some(text.to_string()),
            Some(_) if text.is_empty() => break,
            Some(_) => {
                let Some((name, value)) = text.split_once(':') else {
                    return Err(TransportError::MalformedResponse {
                        reason: format!("bad header line '{}'", text),
                    });
                };
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    Ok((start_line.unwrap_or_default(), headers))
}

/// Reads until EOF or until the socket read timeout expires
fn read_until_idle<R: Read>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(body)
}
