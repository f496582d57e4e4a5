//! HTTP/1.x client side for warp ships.
//!
//! Requests go upstream with `Connection: close`, so the response is
//! delimited by the upstream closing the connection. Response bytes are
//! relayed verbatim.

use bytes::{Bytes, BytesMut};
use std::fmt::Write;

use super::{WarpEvent, WarpHandler};
use crate::tour::Tour;
use crate::types::{Error, Result};

const HOP_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Default)]
pub struct H1WarpHandler {
    current: Option<u16>,
}

impl H1WarpHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WarpHandler for H1WarpHandler {
    fn protocol(&self) -> &'static str {
        "h1"
    }

    fn encode_request(&mut self, warp_id: u16, tour: &Tour, out: &mut BytesMut) -> Result<()> {
        if let Some(current) = self.current {
            return Err(Error::sink(format!(
                "h1 warp already carries request {}, got {}",
                current, warp_id
            )));
        }
        let req = &tour.req;
        let fmt_err = |_| Error::sink("formatting upstream request failed");
        write!(out, "{} {} HTTP/1.1\r\n", req.method, req.uri).map_err(fmt_err)?;
        for (name, value) in &req.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            write!(out, "{}: {}\r\n", name, value).map_err(fmt_err)?;
        }
        if let Some(remote) = req.remote {
            write!(out, "X-Forwarded-For: {}\r\n", remote.ip()).map_err(fmt_err)?;
        }
        let proto = if req.secure { "https" } else { "http" };
        write!(out, "X-Forwarded-Proto: {}\r\n", proto).map_err(fmt_err)?;
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        self.current = Some(warp_id);
        Ok(())
    }

    fn bytes_received(&mut self, buf: &[u8]) -> Result<Vec<WarpEvent>> {
        let warp_id = self
            .current
            .ok_or_else(|| Error::protocol("upstream sent data with no request outstanding"))?;
        Ok(vec![WarpEvent::Data {
            warp_id,
            data: Bytes::copy_from_slice(buf),
        }])
    }

    fn on_eof(&mut self) -> Vec<WarpEvent> {
        match self.current.take() {
            Some(warp_id) => vec![WarpEvent::End { warp_id }],
            None => Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }
}
