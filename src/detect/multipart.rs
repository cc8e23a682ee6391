// Incremental multipart/mixed parser for readImageBlock responses.
//
// Bytes can be fed in arbitrary slices; the parser only holds back enough of
// a body to recognise a delimiter that straddles two slices, so part payloads
// are handed out as they arrive instead of being collected in one buffer.

use bytes::{Buf, Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

use crate::config::MAX_PART_HEADER_BYTES;
use crate::error::{Result, ScanError};

pub const MULTIPART_MIXED: &str = "multipart/mixed";

const CRLF: &[u8] = b"\r\n";
const MAX_DELIMITER_LINE: usize = 1024;

#[derive(Debug)]
pub enum MultipartEvent {
    /// A new body part starts; its headers are complete.
    PartBegin(HeaderMap),
    /// A slice of the current part's body.
    Data(Bytes),
    /// The current part's body is complete.
    PartEnd,
}

/// A fully collected body part, as returned by [`parse`].
#[derive(Debug, Clone)]
pub struct Part {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Part {
    pub fn kind(&self) -> PartKind {
        PartKind::of(&self.headers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Json,
    Pdf,
    Other,
}

impl PartKind {
    pub fn of(headers: &HeaderMap) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if content_type.starts_with("application/json") {
            PartKind::Json
        } else if content_type.starts_with("application/pdf") {
            PartKind::Pdf
        } else {
            PartKind::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Epilogue,
}

pub struct MultipartParser {
    /// `CRLF--boundary`: the line ending before a delimiter belongs to the delimiter.
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(CRLF);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());

        // Seed with a line ending so a delimiter at the very start of the body matches.
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        buffer.extend_from_slice(CRLF);

        Self {
            delimiter,
            buffer,
            state: State::Preamble,
        }
    }

    /// Consume the next slice of the body and return the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultipartEvent>> {
        let mut events = Vec::new();
        if self.state == State::Epilogue {
            return Ok(events);
        }
        self.buffer.extend_from_slice(chunk);
        self.drain(&mut events)?;
        Ok(events)
    }

    /// True once the closing delimiter has been seen.
    pub fn is_complete(&self) -> bool {
        self.state == State::Epilogue
    }

    /// Signal end of input. Fails if the closing delimiter never arrived.
    pub fn finish(self) -> Result<()> {
        if self.state != State::Epilogue {
            return Err(ScanError::MalformedMultipart(format!(
                "body ended in state {:?} before the closing boundary",
                self.state
            )));
        }
        Ok(())
    }

    fn drain(&mut self, events: &mut Vec<MultipartEvent>) -> Result<()> {
        loop {
            match self.state {
                State::Preamble => match find(&self.buffer, &self.delimiter) {
                    Some(pos) => {
                        self.buffer.advance(pos + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            let discard = self.buffer.len() - keep;
                            self.buffer.advance(discard);
                        }
                        return Ok(());
                    }
                },
                State::AfterDelimiter => {
                    if self.buffer.len() < 2 {
                        return Ok(());
                    }
                    if self.buffer.starts_with(b"--") {
                        self.state = State::Epilogue;
                        self.buffer.clear();
                        return Ok(());
                    }
                    let Some(eol) = find(&self.buffer, CRLF) else {
                        if self.buffer.len() > MAX_DELIMITER_LINE {
                            return Err(malformed("delimiter line too long"));
                        }
                        return Ok(());
                    };
                    // Only transport padding may follow the boundary on its line.
                    if !self.buffer[..eol].iter().all(|b| *b == b' ' || *b == b'\t') {
                        return Err(malformed("unexpected bytes after boundary"));
                    }
                    self.buffer.advance(eol + CRLF.len());
                    self.state = State::Headers;
                }
                State::Headers => {
                    if self.buffer.starts_with(CRLF) {
                        self.buffer.advance(CRLF.len());
                        events.push(MultipartEvent::PartBegin(HeaderMap::new()));
                        self.state = State::Body;
                        continue;
                    }
                    let Some(end) = find(&self.buffer, b"\r\n\r\n") else {
                        if self.buffer.len() > MAX_PART_HEADER_BYTES {
                            return Err(malformed("part headers too large"));
                        }
                        return Ok(());
                    };
                    if end > MAX_PART_HEADER_BYTES {
                        return Err(malformed("part headers too large"));
                    }
                    let headers = parse_headers(&self.buffer[..end])?;
                    self.buffer.advance(end + 4);
                    events.push(MultipartEvent::PartBegin(headers));
                    self.state = State::Body;
                }
                State::Body => match find(&self.buffer, &self.delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            events.push(MultipartEvent::Data(self.buffer.split_to(pos).freeze()));
                        }
                        self.buffer.advance(self.delimiter.len());
                        events.push(MultipartEvent::PartEnd);
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        // Hold back a possible delimiter prefix at the tail.
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            let ready = self.buffer.len() - keep;
                            events.push(MultipartEvent::Data(self.buffer.split_to(ready).freeze()));
                        }
                        return Ok(());
                    }
                },
                State::Epilogue => {
                    self.buffer.clear();
                    return Ok(());
                }
            }
        }
    }
}

/// Parse a complete in-memory body into its parts.
pub fn parse(boundary: &str, body: &[u8]) -> Result<Vec<Part>> {
    let mut parser = MultipartParser::new(boundary);
    let mut parts = Vec::new();
    let mut current: Option<(HeaderMap, BytesMut)> = None;

    for event in parser.feed(body)? {
        match event {
            MultipartEvent::PartBegin(headers) => current = Some((headers, BytesMut::new())),
            MultipartEvent::Data(data) => {
                if let Some((_, buf)) = current.as_mut() {
                    buf.extend_from_slice(&data);
                }
            }
            MultipartEvent::PartEnd => {
                if let Some((headers, buf)) = current.take() {
                    parts.push(Part {
                        headers,
                        body: buf.freeze(),
                    });
                }
            }
        }
    }
    parser.finish()?;
    Ok(parts)
}

/// Check that a response is `multipart/mixed` and pull the boundary out of its content type.
pub fn boundary_from_content_type(content_type: Option<&str>) -> Result<String> {
    let Some(content_type) = content_type else {
        return Err(ScanError::UnexpectedMimeType {
            found: "<none>".to_string(),
        });
    };

    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or("").trim();
    if !mime.eq_ignore_ascii_case(MULTIPART_MIXED) {
        return Err(ScanError::UnexpectedMimeType {
            found: mime.to_string(),
        });
    }

    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("boundary") {
            let boundary = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if boundary.is_empty() {
                return Err(ScanError::MissingBoundary);
            }
            return Ok(boundary.to_string());
        }
    }

    Err(ScanError::MissingBoundary)
}

fn parse_headers(block: &[u8]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| malformed("part header without ':'"))?;
        let name = HeaderName::from_bytes(line[..colon].trim_ascii())
            .map_err(|e| malformed(&format!("bad header name: {}", e)))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|e| malformed(&format!("bad header value: {}", e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn malformed(msg: &str) -> ScanError {
    ScanError::MalformedMultipart(msg.to_string())
}
