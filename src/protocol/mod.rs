//! Protocol handlers.
//!
//! Handlers turn wire bytes into protocol-neutral events and encode tour
//! responses back into wire bytes. They never touch the multiplexer; ships
//! drive them.

mod h1;
mod h1_warp;

pub use h1::H1InboundHandler;
pub use h1_warp::H1WarpHandler;

use bytes::{Bytes, BytesMut};
use std::fmt::Debug;

use crate::tour::{RequestHead, ResPart, Tour};
use crate::types::Result;

/// Event decoded from an inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A complete request head.
    Request { req_key: u16, head: RequestHead },
    /// Request body bytes.
    Content { req_key: u16, data: Bytes },
    /// The request body is complete.
    EndOfRequest { req_key: u16 },
    /// Malformed input. It is answered with `status` once every earlier
    /// request on the connection has been served.
    Malformed { status: u16, reason: String },
}

/// Result of feeding bytes to an inbound handler.
#[derive(Debug)]
pub enum Decoded {
    Events(Vec<InboundEvent>),
    /// Replace the handler and dispatch the same bytes to the new one.
    /// Nothing of the current buffer has been consumed.
    Upgrade(Box<dyn InboundHandler>),
}

/// Server-side protocol handler of an inbound ship.
pub trait InboundHandler: Debug {
    fn protocol(&self) -> &'static str;

    /// Decode freshly read bytes.
    ///
    /// Malformed input is reported either as `Error::Protocol` or as a
    /// trailing `InboundEvent::Malformed` after the events decoded before it.
    fn bytes_received(&mut self, buf: &[u8]) -> Result<Decoded>;

    /// Encode one queued response part of `tour`.
    fn encode(&mut self, part: &ResPart, tour: &Tour, out: &mut BytesMut) -> Result<()>;

    /// Whether the connection may carry another request after this tour.
    fn keep_alive(&self, tour: &Tour) -> bool;

    /// A complete error response not tied to a tour (admission refusals,
    /// protocol faults).
    fn error_response(&self, status: u16) -> Bytes;

    /// Lenient handlers keep the connection after answering a protocol fault.
    fn lenient(&self) -> bool {
        false
    }

    /// Drop any partially decoded input.
    fn reset(&mut self);
}

/// Event decoded from an upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarpEvent {
    /// Response bytes for the tour correlated by `warp_id`.
    Data { warp_id: u16, data: Bytes },
    /// The response for `warp_id` is complete.
    End { warp_id: u16 },
}

/// Client-side protocol handler of a warp ship.
pub trait WarpHandler: Debug {
    fn protocol(&self) -> &'static str;

    /// Encode the request head of `tour` under correlation id `warp_id`.
    fn encode_request(&mut self, warp_id: u16, tour: &Tour, out: &mut BytesMut) -> Result<()>;

    /// Decode upstream bytes.
    fn bytes_received(&mut self, buf: &[u8]) -> Result<Vec<WarpEvent>>;

    /// Upstream closed its side.
    fn on_eof(&mut self) -> Vec<WarpEvent>;

    fn reset(&mut self);
}

/// Reason phrase for the statuses this server produces itself.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
