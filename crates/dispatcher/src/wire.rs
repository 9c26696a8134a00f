//! HTTP/1.1 wire rendering of invocations and agent replies.
//!
//! Agents receive the inbound request as raw HTTP/1.1 bytes and answer with
//! raw HTTP/1.1 response bytes. Bodies are always fully buffered here, so
//! serialized messages carry `Content-Length` rather than chunked framing.
use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use http::{
    header::{
        CONTENT_LENGTH,
        HOST,
        TRANSFER_ENCODING,
    },
    HeaderMap,
    HeaderName,
    HeaderValue,
    Method,
    Request,
    Response,
    StatusCode,
    Uri,
};

const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("HTTP message is incomplete")]
    Incomplete,
    #[error("HTTP message is malformed: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("Invalid status line: {0}")]
    InvalidStatus(String),
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),
    #[error("Invalid header {0}")]
    InvalidHeader(String),
    #[error("Body is shorter than its Content-Length ({actual} of {expected} bytes)")]
    ShortBody { expected: usize, actual: usize },
    #[error("Chunked body is malformed")]
    InvalidChunk,
}

/// Renders `request` as HTTP/1.1 bytes: request line, headers, blank line,
/// body.
pub fn serialize_request(request: &Request<Bytes>) -> Bytes {
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let mut out = BytesMut::with_capacity(256 + request.body().len());
    out.put_slice(format!("{} {target} HTTP/1.1\r\n", request.method()).as_bytes());
    if !request.headers().contains_key(HOST) {
        if let Some(authority) = request.uri().authority() {
            put_header(&mut out, HOST.as_str(), authority.as_str().as_bytes());
        }
    }
    put_headers_and_body(&mut out, request.headers(), request.body());
    out.freeze()
}

/// Renders `response` as HTTP/1.1 bytes: status line, headers, blank line,
/// body.
pub fn serialize_response(response: &Response<Bytes>) -> Bytes {
    let status = response.status();
    let mut out = BytesMut::with_capacity(128 + response.body().len());
    out.put_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    put_headers_and_body(&mut out, response.headers(), response.body());
    out.freeze()
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

fn put_headers_and_body(out: &mut BytesMut, headers: &HeaderMap, body: &Bytes) {
    for (name, value) in headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        put_header(out, name.as_str(), value.as_bytes());
    }
    if !body.is_empty() || headers.contains_key(CONTENT_LENGTH) {
        put_header(out, CONTENT_LENGTH.as_str(), body.len().to_string().as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
}

/// Parses HTTP/1.1 request bytes, the inverse of [`serialize_request`].
pub fn parse_request(bytes: &Bytes) -> Result<Request<Bytes>, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let header_len = match parsed.parse(bytes)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(WireError::Incomplete),
    };
    let method = parsed.method.ok_or(WireError::Incomplete)?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| WireError::InvalidTarget(method.to_owned()))?;
    let path = parsed.path.ok_or(WireError::Incomplete)?;
    let uri: Uri = path
        .parse()
        .map_err(|_| WireError::InvalidTarget(path.to_owned()))?;
    let mut header_map = collect_headers(parsed.headers)?;
    let body = read_body(&mut header_map, bytes.slice(header_len..))?;

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = header_map;
    Ok(request)
}

/// Parses an agent's HTTP/1.1 reply. A `Content-Length` body is cut to the
/// declared length; a chunked body is decoded and re-framed with
/// `Content-Length`.
pub fn parse_response(bytes: &Bytes) -> Result<Response<Bytes>, WireError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let header_len = match parsed.parse(bytes)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(WireError::Incomplete),
    };
    let code = parsed.code.ok_or(WireError::Incomplete)?;
    let status =
        StatusCode::from_u16(code).map_err(|_| WireError::InvalidStatus(code.to_string()))?;
    let mut header_map = collect_headers(parsed.headers)?;
    let body = read_body(&mut header_map, bytes.slice(header_len..))?;

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = header_map;
    Ok(response)
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Result<HeaderMap, WireError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| WireError::InvalidHeader(header.name.to_owned()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| WireError::InvalidHeader(header.name.to_owned()))?;
        map.append(name, value);
    }
    Ok(map)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn read_body(headers: &mut HeaderMap, mut body: Bytes) -> Result<Bytes, WireError> {
    if is_chunked(headers) {
        let decoded = decode_chunked(&body)?;
        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(decoded.len()));
        return Ok(decoded);
    }
    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let expected: usize = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| WireError::InvalidHeader(CONTENT_LENGTH.to_string()))?;
        if body.len() < expected {
            return Err(WireError::ShortBody {
                expected,
                actual: body.len(),
            });
        }
        body.truncate(expected);
    }
    Ok(body)
}

fn decode_chunked(mut buf: &[u8]) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(buf.len());
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(buf) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Err(WireError::Incomplete),
            Err(_) => return Err(WireError::InvalidChunk),
        };
        buf = &buf[consumed..];
        if size == 0 {
            return Ok(out.freeze());
        }
        let size = usize::try_from(size).map_err(|_| WireError::InvalidChunk)?;
        if buf.len() < size.saturating_add(2) {
            return Err(WireError::Incomplete);
        }
        out.put_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(WireError::InvalidChunk);
        }
        buf = &buf[size + 2..];
    }
}
