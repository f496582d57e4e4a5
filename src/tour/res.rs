//! Response side of a tour.
//!
//! Clubs and warp ships append protocol-neutral parts to the outbox; the
//! inbound ship's protocol handler encodes them when the tour is flushed.

use bytes::Bytes;
use std::collections::VecDeque;

use super::req::header_value;
use crate::types::{Error, Result};

/// One queued piece of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResPart {
    /// Status line and headers (taken from `TourRes` at encode time).
    Headers,
    /// Body bytes.
    Content(Bytes),
    /// End of the response.
    End,
    /// Bytes relayed verbatim (already encoded by an upstream).
    Raw(Bytes),
}

#[derive(Debug)]
pub struct TourRes {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    headers_sent: bool,
    ended: bool,
    raw: bool,
    bytes_sent: usize,
    outbox: VecDeque<ResPart>,
}

impl Default for TourRes {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            content_length: None,
            headers_sent: false,
            ended: false,
            raw: false,
            bytes_sent: 0,
            outbox: VecDeque::new(),
        }
    }
}

impl TourRes {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn set_content_length(&mut self, len: usize) {
        self.content_length = Some(len);
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// True when the response is relayed verbatim from an upstream.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn send_headers(&mut self) -> Result<()> {
        if self.headers_sent {
            return Err(Error::sink("response headers sent twice"));
        }
        self.headers_sent = true;
        self.outbox.push_back(ResPart::Headers);
        Ok(())
    }

    pub fn send_content(&mut self, data: Bytes) -> Result<()> {
        if self.ended {
            return Err(Error::sink("content sent after response end"));
        }
        if !self.headers_sent {
            self.send_headers()?;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.bytes_sent += data.len();
        self.outbox.push_back(ResPart::Content(data));
        Ok(())
    }

    pub fn send_raw(&mut self, data: Bytes) -> Result<()> {
        if self.ended {
            return Err(Error::sink("raw bytes sent after response end"));
        }
        self.raw = true;
        self.headers_sent = true;
        self.bytes_sent += data.len();
        self.outbox.push_back(ResPart::Raw(data));
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(Error::sink("response ended twice"));
        }
        if !self.headers_sent {
            self.send_headers()?;
        }
        self.ended = true;
        self.outbox.push_back(ResPart::End);
        Ok(())
    }

    /// Answer with a plain-text error, or just end the response when the
    /// headers are already out.
    pub fn send_error(&mut self, status: u16, message: &str) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        if !self.headers_sent {
            let body = Bytes::from(format!("{} {}\n", status, message));
            self.status = status;
            self.headers.clear();
            self.add_header("Content-Type", "text/plain; charset=utf-8");
            self.content_length = Some(body.len());
            self.send_content(body)?;
        }
        self.end()
    }

    /// Drain queued parts for encoding.
    pub fn take_parts(&mut self) -> Vec<ResPart> {
        self.outbox.drain(..).collect()
    }

    pub(crate) fn reset(&mut self) {
        *self = TourRes::default();
    }
}
