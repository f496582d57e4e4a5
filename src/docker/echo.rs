use bytes::Bytes;
use std::fmt::Write;

use super::{Arrival, Club};
use crate::tour::Tour;
use crate::types::{Error, Result};

/// Answers every request with a plain-text dump of its head followed by
/// the request body, streamed as it arrives.
#[derive(Debug, Default)]
pub struct EchoClub;

impl EchoClub {
    fn describe(tour: &Tour) -> Result<String> {
        let req = &tour.req;
        let mut out = String::new();
        let fmt_err = |_| Error::sink("formatting echo response failed");
        writeln!(out, "{} {} {}", req.method, req.uri, req.version).map_err(fmt_err)?;
        for (name, value) in &req.headers {
            writeln!(out, "{}: {}", name, value).map_err(fmt_err)?;
        }
        out.push('\n');
        Ok(out)
    }
}

impl Club for EchoClub {
    fn name(&self) -> &str {
        "echo"
    }

    fn arrive(&self, tour: &mut Tour) -> Result<Arrival> {
        let head = Bytes::from(Self::describe(tour)?);
        let body_len = tour.req.content_length.unwrap_or(0);

        tour.res.set_status(200);
        tour.res.add_header("Content-Type", "text/plain; charset=utf-8");
        tour.res.set_content_length(head.len() + body_len);
        tour.res.send_content(head)?;
        if body_len == 0 {
            tour.res.end()?;
        }
        Ok(Arrival::Served)
    }

    fn content(&self, tour: &mut Tour, data: Bytes) -> Result<()> {
        tour.req.received += data.len();
        if tour.res.is_ended() {
            return Ok(());
        }
        tour.res.send_content(data)
    }

    fn end_content(&self, tour: &mut Tour) -> Result<()> {
        tour.req.ended = true;
        if tour.res.is_ended() {
            return Ok(());
        }
        tour.res.end()
    }
}
