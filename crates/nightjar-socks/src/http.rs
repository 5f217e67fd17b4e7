//! Just enough HTTP/1.1 to carry JSON envelopes and release downloads.
//!
//! One request per connection (`Connection: close`), bodies framed by
//! `Content-Length`, chunked transfer coding, or EOF.  In-memory bodies
//! are capped; the streaming path (used for artifact downloads) writes
//! straight through to a caller-supplied sink.

use std::io::Write;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::err::FetchError;
use crate::Result;

/// Maximum size of the response head (status line + headers).
const MAX_HEAD: usize = 16 * 1024;

/// Hard cap for in-memory response bodies.
pub(crate) const BODY_CAP: usize = 256 * 1024;

/// Maximum number of headers we bother to parse.
const MAX_HEADERS: usize = 32;

/// A parsed response head.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    /// HTTP status code.
    pub(crate) status: u16,
    /// Status reason phrase, if the server sent one.
    pub(crate) reason: Option<String>,
    /// Header name/value pairs, in wire order.
    pub(crate) headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive single-header lookup.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// How the body of a response is delimited.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum BodyFraming {
    /// Exactly this many bytes.
    Length(usize),
    /// Chunked transfer coding.
    Chunked,
    /// Read until the peer closes.
    UntilEof,
}

/// Serialize and send a request, without waiting for the response.
pub(crate) async fn write_request<S>(
    stream: &mut S,
    method: &str,
    host_header: &str,
    path_and_query: &str,
    headers: &[(String, String)],
    body: Option<&[u8]>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = String::with_capacity(256);
    out.push_str(method);
    out.push(' ');
    out.push_str(path_and_query);
    out.push_str(" HTTP/1.1\r\n");
    out.push_str("Host: ");
    out.push_str(host_header);
    out.push_str("\r\nConnection: close\r\n");
    if let Some(body) = body {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");

    stream
        .write_all(out.as_bytes())
        .await
        .map_err(|e| FetchError::upstream(format!("writing request: {e}")))?;
    if let Some(body) = body {
        stream
            .write_all(body)
            .await
            .map_err(|e| FetchError::upstream(format!("writing request body: {e}")))?;
    }
    stream
        .flush()
        .await
        .map_err(|e| FetchError::upstream(format!("flushing request: {e}")))?;
    Ok(())
}

/// Read and parse the response head, returning it together with any body
/// bytes that arrived in the same reads.
pub(crate) async fn read_head<S>(stream: &mut S) -> Result<(ResponseHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 2048];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| FetchError::upstream(format!("reading response head: {e}")))?;
        if n == 0 {
            return Err(FetchError::upstream("connection closed before response head"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = parsed
                    .code
                    .ok_or_else(|| FetchError::upstream("response missing status code"))?;
                let reason = parsed.reason.map(str::to_owned).filter(|r| !r.is_empty());
                let headers = parsed
                    .headers
                    .iter()
                    .map(|h| {
                        let value = String::from_utf8_lossy(h.value).into_owned();
                        (h.name.to_owned(), value)
                    })
                    .collect();
                let rest = buf[head_len..].to_vec();
                return Ok((ResponseHead { status, reason, headers }, rest));
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD {
                    return Err(FetchError::upstream("response head too large"));
                }
            }
            Err(e) => {
                return Err(FetchError::upstream(format!("malformed response: {e}")));
            }
        }
    }
}

/// Determine how the body is framed from the head.
fn framing(head: &ResponseHead) -> Result<BodyFraming> {
    if let Some(te) = head.header("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(FetchError::upstream(format!(
            "unsupported transfer encoding: {te}"
        )));
    }
    if let Some(cl) = head.header("content-length") {
        let n: usize = cl
            .trim()
            .parse()
            .map_err(|_| FetchError::upstream(format!("bad content-length: {cl}")))?;
        return Ok(BodyFraming::Length(n));
    }
    Ok(BodyFraming::UntilEof)
}

/// Read the whole body into memory, enforcing `cap`.
pub(crate) async fn read_body<S>(
    stream: &mut S,
    head: &ResponseHead,
    mut leftover: Vec<u8>,
    cap: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut sink = CapSink {
        out: &mut out,
        cap,
    };
    copy_body(stream, head, &mut leftover, &mut sink).await?;
    Ok(out)
}

/// Stream the body into `sink` with no size cap; returns bytes written.
pub(crate) async fn stream_body<S, W>(
    stream: &mut S,
    head: &ResponseHead,
    mut leftover: Vec<u8>,
    sink: &mut W,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: Write + Send,
{
    let mut counting = CountingSink { inner: sink, n: 0 };
    copy_body(stream, head, &mut leftover, &mut counting).await?;
    Ok(counting.n)
}

/// A sink for decoded body bytes.
trait BodySink: Send {
    /// Accept a run of body bytes.
    fn push(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Collects into a Vec, failing past `cap`.
struct CapSink<'a> {
    /// Destination buffer.
    out: &'a mut Vec<u8>,
    /// Maximum bytes to accept.
    cap: usize,
}

impl BodySink for CapSink<'_> {
    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.out.len() + bytes.len() > self.cap {
            return Err(FetchError::upstream(format!(
                "response body exceeds {} byte cap",
                self.cap
            )));
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }
}

/// Forwards into an `io::Write`, counting bytes.
struct CountingSink<'a, W: Write + Send> {
    /// The underlying writer.
    inner: &'a mut W,
    /// Bytes written so far.
    n: u64,
}

impl<W: Write + Send> BodySink for CountingSink<'_, W> {
    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .map_err(|e| FetchError::upstream(format!("writing body to sink: {e}")))?;
        self.n += bytes.len() as u64;
        Ok(())
    }
}

/// Decode the body into `sink` according to the response framing.
async fn copy_body<S>(
    stream: &mut S,
    head: &ResponseHead,
    leftover: &mut Vec<u8>,
    sink: &mut dyn BodySink,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match framing(head)? {
        BodyFraming::Length(want) => {
            let mut got = 0_usize;
            if !leftover.is_empty() {
                let take = leftover.len().min(want);
                sink.push(&leftover[..take])?;
                got = take;
            }
            let mut chunk = [0_u8; 4096];
            while got < want {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| FetchError::upstream(format!("reading body: {e}")))?;
                if n == 0 {
                    return Err(FetchError::upstream("connection closed mid-body"));
                }
                let take = n.min(want - got);
                sink.push(&chunk[..take])?;
                got += take;
            }
            Ok(())
        }
        BodyFraming::UntilEof => {
            if !leftover.is_empty() {
                sink.push(leftover)?;
            }
            let mut chunk = [0_u8; 4096];
            loop {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| FetchError::upstream(format!("reading body: {e}")))?;
                if n == 0 {
                    return Ok(());
                }
                sink.push(&chunk[..n])?;
            }
        }
        BodyFraming::Chunked => decode_chunked(stream, leftover, sink).await,
    }
}

/// Decode chunked transfer coding.
///
/// Tolerates a terminator-only body (`0\r\n\r\n`) and a missing trailer
/// section when the peer just closes after the zero chunk.
async fn decode_chunked<S>(
    stream: &mut S,
    leftover: &mut Vec<u8>,
    sink: &mut dyn BodySink,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = std::mem::take(leftover);
    let mut pos = 0_usize;
    let mut chunk = [0_u8; 4096];

    /// Pull more bytes into `buf`, returning false at EOF.
    macro_rules! fill {
        () => {{
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| FetchError::upstream(format!("reading chunked body: {e}")))?;
            if n == 0 {
                false
            } else {
                buf.extend_from_slice(&chunk[..n]);
                true
            }
        }};
    }

    loop {
        // Find the size line.
        let line_end = loop {
            if let Some(i) = find_crlf(&buf[pos..]) {
                break pos + i;
            }
            if buf.len() - pos > 1024 {
                return Err(FetchError::upstream("chunk size line too long"));
            }
            if !fill!() {
                return Err(FetchError::upstream("connection closed mid-chunk-size"));
            }
        };
        let line = std::str::from_utf8(&buf[pos..line_end])
            .map_err(|_| FetchError::upstream("non-ascii chunk size"))?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| FetchError::upstream(format!("bad chunk size: {size_str:?}")))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailer section: skip until blank line; EOF right here is fine.
            loop {
                if let Some(i) = find_crlf(&buf[pos..]) {
                    if i == 0 {
                        return Ok(());
                    }
                    pos += i + 2; // a trailer header; ignore it
                    continue;
                }
                if !fill!() {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF.
        while buf.len() < pos + size + 2 {
            if !fill!() {
                return Err(FetchError::upstream("connection closed mid-chunk"));
            }
        }
        sink.push(&buf[pos..pos + size])?;
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(FetchError::upstream("chunk missing CRLF terminator"));
        }
        pos += size + 2;

        // Compact occasionally so long bodies don't pin the whole buffer.
        if pos > 64 * 1024 {
            buf.drain(..pos);
            pos = 0;
        }
    }
}

/// Find the first CRLF in `buf`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    async fn parse_all(raw: &[u8], cap: usize) -> Result<(ResponseHead, Vec<u8>)> {
        let mut stream = Cursor::new(raw.to_vec());
        let (head, rest) = read_head(&mut stream).await?;
        let body = read_body(&mut stream, &head, rest, cap).await?;
        Ok((head, body))
    }

    #[test]
    fn content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Extra: 1\r\n\r\nhello";
        let (head, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason.as_deref(), Some("OK"));
        assert_eq!(head.header("x-extra"), Some("1"));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn until_eof_body() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nstreamed until close";
        let (_, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert_eq!(body, b"streamed until close");
    }

    #[test]
    fn chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (_, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn chunked_terminator_only() {
        let raw = b"HTTP/1.1 204 No Content\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        let (head, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert_eq!(head.status, 204);
        assert!(body.is_empty());
    }

    #[test]
    fn chunked_zero_then_eof() {
        // Some peers close right after the zero chunk, without the final
        // blank line.
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n";
        let (_, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn chunk_extensions_ignored() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5;ext=1\r\nhello\r\n0\r\n\r\n";
        let (_, body) = block_on(parse_all(raw, BODY_CAP)).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn body_cap_enforced() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let err = block_on(parse_all(raw, 4)).unwrap_err();
        assert_eq!(err.code(), "upstream_error");
        assert!(err.to_string().contains("cap"));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let err = block_on(parse_all(raw, BODY_CAP)).unwrap_err();
        assert_eq!(err.code(), "upstream_error");
    }

    #[test]
    fn request_serialization() {
        let mut out = Vec::new();
        block_on(write_request(
            &mut out,
            "POST",
            "x.onion",
            "/onion/ingest",
            &[("Content-Type".to_owned(), "application/json".to_owned())],
            Some(b"{}"),
        ))
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /onion/ingest HTTP/1.1\r\n"));
        assert!(text.contains("Host: x.onion\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn streaming_counts_bytes() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = Cursor::new(raw.to_vec());
        let (head, rest) = block_on(read_head(&mut stream)).unwrap();
        let mut sink = Vec::new();
        let n = block_on(stream_body(&mut stream, &head, rest, &mut sink)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"hello");
    }
}
