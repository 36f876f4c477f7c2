//! Just enough HTTP/1.1 to serve a JSON API: one request per connection,
//! `Content-Length` bodies only, `Connection: close` responses.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest accepted request body.
pub const MAX_BODY: usize = 16 * 1024;

/// Largest accepted request line or header line.
const MAX_LINE: usize = 8 * 1024;

/// Header lines accepted before the request is rejected.
const MAX_HEADERS: usize = 64;

/// A parsed request.  The query string is stripped from `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request body exceeds {} bytes", MAX_BODY)]
    TooLarge,
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ParseError> {
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Err(ParseError::Malformed("connection closed before request".into()));
    }
    if n > MAX_LINE {
        return Err(ParseError::Malformed("line too long".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Read one request from `reader`.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Request, ParseError> {
    let request_line = read_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Malformed(format!("bad request line '{request_line}'")));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::Malformed(format!("unsupported version '{version}'")));
    }
    let path = target.split('?').next().unwrap_or(target).to_string();
    let method = method.to_ascii_uppercase();

    let mut content_length = 0usize;
    let mut headers = 0usize;
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(ParseError::Malformed("too many headers".into()));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::Malformed(format!("bad header '{line}'")));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| ParseError::Malformed("invalid Content-Length".into()))?;
        }
    }

    if content_length > MAX_BODY {
        return Err(ParseError::TooLarge);
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Request { method, path, body })
}

/// A JSON response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    /// Serialise status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.status,
            self.reason(),
            body.len(),
            body
        )
        .into_bytes()
    }
}
