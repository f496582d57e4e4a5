//! HTTP/1.x server side.

use bytes::{Bytes, BytesMut};
use std::fmt::Write;

use super::{reason_phrase, Decoded, InboundEvent, InboundHandler};
use crate::tour::{RequestHead, ResPart, Tour};
use crate::types::{Error, Result};

const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Head,
    Body { req_key: u16, remaining: usize },
    /// Strict mode after a fault: input is ignored.
    Failed,
}

#[derive(Debug)]
pub struct H1InboundHandler {
    buf: BytesMut,
    state: ReadState,
    last_req_key: u16,
    lenient: bool,
}

impl Default for H1InboundHandler {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ReadState::Head,
            last_req_key: 0,
            lenient: false,
        }
    }
}

impl H1InboundHandler {
    /// Handler that answers malformed requests with 400 and keeps reading.
    pub fn new_lenient() -> Self {
        Self {
            lenient: true,
            ..Self::default()
        }
    }

    fn next_req_key(&mut self) -> u16 {
        self.last_req_key = self.last_req_key.wrapping_add(1);
        if self.last_req_key == 0 {
            self.last_req_key = 1;
        }
        self.last_req_key
    }

    fn decode_head(&mut self, events: &mut Vec<InboundEvent>) -> Result<bool> {
        while self.buf.starts_with(b"\r\n") {
            let _ = self.buf.split_to(2);
        }
        let Some(end) = find_head_end(&self.buf) else {
            if self.buf.len() > MAX_HEAD_SIZE {
                self.buf.clear();
                return Err(Error::protocol("request head too large"));
            }
            return Ok(false);
        };
        let raw = self.buf.split_to(end + 4);
        let head = parse_head(&raw[..end])?;
        let req_key = self.next_req_key();
        let length = head.content_length.unwrap_or(0);
        events.push(InboundEvent::Request { req_key, head });
        if length == 0 {
            events.push(InboundEvent::EndOfRequest { req_key });
        } else {
            self.state = ReadState::Body {
                req_key,
                remaining: length,
            };
        }
        Ok(true)
    }

    /// Queue the fault behind what was decoded before it. A strict handler
    /// drops everything that follows; a lenient one resumes at the next head.
    fn fail(&mut self, err: &Error, events: &mut Vec<InboundEvent>) {
        self.state = if self.lenient {
            ReadState::Head
        } else {
            self.buf.clear();
            ReadState::Failed
        };
        events.push(InboundEvent::Malformed {
            status: err.to_http_status(),
            reason: err.to_string(),
        });
    }

    fn encode_headers(&self, tour: &Tour, out: &mut BytesMut) -> Result<()> {
        let res = &tour.res;
        let status = res.status();
        write!(out, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).map_err(fmt_error)?;
        for (name, value) in res.headers() {
            if is_hop_header(name) {
                continue;
            }
            write!(out, "{}: {}\r\n", name, value).map_err(fmt_error)?;
        }
        if let Some(len) = res.content_length() {
            write!(out, "Content-Length: {}\r\n", len).map_err(fmt_error)?;
        } else if is_chunked(tour) {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if self.keep_alive(tour) {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        } else {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        Ok(())
    }
}

impl InboundHandler for H1InboundHandler {
    fn protocol(&self) -> &'static str {
        "h1"
    }

    fn bytes_received(&mut self, buf: &[u8]) -> Result<Decoded> {
        self.buf.extend_from_slice(buf);
        let mut events = Vec::new();
        loop {
            match self.state {
                ReadState::Head => match self.decode_head(&mut events) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        self.fail(&e, &mut events);
                        if !self.lenient {
                            break;
                        }
                    }
                },
                ReadState::Failed => {
                    self.buf.clear();
                    break;
                }
                ReadState::Body { req_key, remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let n = remaining.min(self.buf.len());
                    let data = self.buf.split_to(n).freeze();
                    events.push(InboundEvent::Content { req_key, data });
                    if n == remaining {
                        events.push(InboundEvent::EndOfRequest { req_key });
                        self.state = ReadState::Head;
                    } else {
                        self.state = ReadState::Body {
                            req_key,
                            remaining: remaining - n,
                        };
                    }
                }
            }
        }
        Ok(Decoded::Events(events))
    }

    fn encode(&mut self, part: &ResPart, tour: &Tour, out: &mut BytesMut) -> Result<()> {
        let head_only = tour.req.method.eq_ignore_ascii_case("HEAD");
        match part {
            ResPart::Headers => self.encode_headers(tour, out)?,
            ResPart::Content(_) | ResPart::End if head_only => {}
            ResPart::Content(data) if is_chunked(tour) => {
                write!(out, "{:x}\r\n", data.len()).map_err(fmt_error)?;
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            ResPart::Content(data) => out.extend_from_slice(data),
            ResPart::End if is_chunked(tour) => out.extend_from_slice(b"0\r\n\r\n"),
            ResPart::End => {}
            ResPart::Raw(data) => out.extend_from_slice(data),
        }
        Ok(())
    }

    fn keep_alive(&self, tour: &Tour) -> bool {
        if tour.res.is_raw() || tour.is_aborted() {
            return false;
        }
        let connection = tour.req.header("connection").map(str::to_ascii_lowercase);
        match tour.req.version.as_str() {
            "HTTP/1.1" => connection.as_deref() != Some("close"),
            _ => {
                connection.as_deref() == Some("keep-alive") && tour.res.content_length().is_some()
            }
        }
    }

    fn error_response(&self, status: u16) -> Bytes {
        let reason = reason_phrase(status);
        let body = format!("{} {}\n", status, reason);
        let connection = if self.lenient { "keep-alive" } else { "close" };
        Bytes::from(format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
            status,
            reason,
            body.len(),
            connection,
            body
        ))
    }

    fn lenient(&self) -> bool {
        self.lenient
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.state = ReadState::Head;
    }
}

fn fmt_error(_: std::fmt::Error) -> Error {
    Error::sink("formatting into a byte buffer failed")
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn is_hop_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection", "keep-alive"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn is_chunked(tour: &Tour) -> bool {
    !tour.res.is_raw() && tour.res.content_length().is_none() && tour.req.version == "HTTP/1.1"
}

fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let text =
        std::str::from_utf8(raw).map_err(|_| Error::protocol("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::protocol(format!("malformed request line: {:?}", request_line)));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(Error::protocol(format!("unsupported version {}", version)));
    }

    let mut head = RequestHead {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
        content_length: None,
    };
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line: {:?}", line)))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(Error::protocol("empty header name"));
        }
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<usize>()
                .map_err(|_| Error::protocol(format!("invalid content-length {:?}", value)))?;
            head.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            return Err(Error::protocol("chunked request bodies are not supported"));
        }
        head.headers.push((name.to_string(), value.to_string()));
    }
    Ok(head)
}
