//! Minimal HTTP/1.x codec for the initial request of an intercepted tunnel.
//!
//! Exactly one request is decoded from the decrypted client stream. Header
//! lines are kept as received so the replay towards the origin preserves
//! their order and casing, with only `Host` (and chunked framing) rewritten.

use crate::error::{ProxyError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Request line and raw header lines of a decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the request target.
    pub fn path(&self) -> &str {
        let path = self.target.split_once('?').map_or(self.target.as_str(), |(p, _)| p);
        path.split_once('#').map_or(path, |(p, _)| p)
    }

    pub fn query(&self) -> Option<&str> {
        self.target
            .split_once('?')
            .map(|(_, q)| q.split_once('#').map_or(q, |(q, _)| q))
    }
}

/// A fully buffered request.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
    /// The body arrived with chunked transfer coding and was de-chunked.
    pub chunked: bool,
}

fn decode_error(msg: impl Into<String>) -> ProxyError {
    ProxyError::RequestDecode(msg.into())
}

/// Read one CRLF (or bare LF) terminated line, without the terminator.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| decode_error(format!("read failed: {}", e)))?;
    if n == 0 {
        return Ok(None);
    }
    if n > *budget {
        return Err(decode_error("request head too large"));
    }
    *budget -= n;

    if line.last() != Some(&b'\n') {
        return Err(decode_error("unexpected end of stream in request head"));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| decode_error("request head is not valid UTF-8"))
}

/// Decode exactly one request and buffer its body.
///
/// Bodies larger than `max_body` bytes are rejected before they are read.
pub async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<DecodedRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    let request_line = read_line(reader, &mut budget)
        .await?
        .ok_or_else(|| decode_error("connection closed before a request was sent"))?;

    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(decode_error(format!("malformed request line: {:?}", request_line))),
    };
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(decode_error(format!("unsupported protocol version {}", version)));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| decode_error("unexpected end of stream in request head"))?;
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(decode_error("obsolete header line folding"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| decode_error(format!("malformed header line: {:?}", line)))?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(decode_error(format!("invalid header name: {:?}", name)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
        if headers.len() > MAX_HEADERS {
            return Err(decode_error("too many headers"));
        }
    }

    let head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    };

    let (body, chunked) = match body_framing(&head)? {
        Framing::Chunked => (read_chunked(reader, &mut budget, max_body).await?, true),
        Framing::Length(len) => {
            if len > max_body {
                return Err(body_too_large(max_body));
            }
            let mut body = Vec::with_capacity(len);
            read_exactly(reader, len, &mut body)
                .await
                .map_err(|e| decode_error(format!("body shorter than Content-Length: {}", e)))?;
            (body, false)
        }
    };

    Ok(DecodedRequest {
        head,
        body,
        chunked,
    })
}

fn body_too_large(max_body: usize) -> ProxyError {
    decode_error(format!("request body exceeds {} bytes", max_body))
}

/// Append exactly `len` bytes from `reader` to `buf`, growing it as data arrives.
async fn read_exactly<R>(reader: &mut R, len: usize, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(len as u64).read_to_end(buf).await?;
    if read < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

enum Framing {
    Chunked,
    Length(usize),
}

fn body_framing(head: &RequestHead) -> Result<Framing> {
    let codings: Vec<&str> = head
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if let Some(last) = codings.last() {
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked);
        }
        return Err(decode_error(format!("unsupported transfer encoding {}", last)));
    }

    let mut length: Option<usize> = None;
    for (_, value) in head
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        let parsed = value
            .parse::<usize>()
            .map_err(|_| decode_error(format!("invalid Content-Length {:?}", value)))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(decode_error("conflicting Content-Length headers"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(Framing::Length(length.unwrap_or(0)))
}

async fn read_chunked<R>(reader: &mut R, budget: &mut usize, max_body: usize) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        // Chunk-size lines and trailers share the head budget
        let size_line = read_line(reader, budget)
            .await?
            .ok_or_else(|| decode_error("unexpected end of stream in chunked body"))?;
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| decode_error(format!("invalid chunk size {:?}", size_str)))?;

        if size == 0 {
            // Trailers are discarded
            loop {
                let trailer = read_line(reader, budget)
                    .await?
                    .ok_or_else(|| decode_error("unexpected end of stream in trailers"))?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        match body.len().checked_add(size) {
            Some(total) if total <= max_body => {}
            _ => return Err(body_too_large(max_body)),
        }
        read_exactly(reader, size, &mut body)
            .await
            .map_err(|e| decode_error(format!("truncated chunk: {}", e)))?;

        let terminator = read_line(reader, budget).await?;
        if terminator.as_deref() != Some("") {
            return Err(decode_error("missing CRLF after chunk data"));
        }
    }
}

/// Serialize a decoded request for the origin with `Host` set to `host`.
///
/// Header lines are emitted as received. A de-chunked body is re-framed with
/// `Content-Length` in place of `Transfer-Encoding`.
pub fn encode_replay(request: &DecodedRequest, host: &str) -> Vec<u8> {
    let head = &request.head;
    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", head.method, head.target, head.version).as_bytes(),
    );

    let has_host = head.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("host"));
    if !has_host {
        out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
    }

    let mut host_written = false;
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") {
            if !host_written {
                out.extend_from_slice(format!("{}: {}\r\n", name, host).as_bytes());
                host_written = true;
            }
            continue;
        }
        if request.chunked
            && (name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("content-length"))
        {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    if request.chunked {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}
