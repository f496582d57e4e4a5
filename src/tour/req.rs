//! Request side of a tour.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

/// Decoded request line and headers, as produced by an inbound protocol handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<usize>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Buffer credit for request content that has been handed to a consumer but
/// not yet drained (e.g. posted upstream but not yet written).
///
/// Shared between the tour and write-completion callbacks of the same agent,
/// hence `Rc`.
#[derive(Debug, Clone, Default)]
pub struct ContentCredit {
    in_flight: Rc<Cell<usize>>,
    limit: usize,
}

impl ContentCredit {
    pub fn new(limit: usize) -> Self {
        Self {
            in_flight: Rc::new(Cell::new(0)),
            limit,
        }
    }

    /// Account `n` more bytes. Returns true while the consumer still has room.
    pub fn acquire(&self, n: usize) -> bool {
        self.in_flight.set(self.in_flight.get() + n);
        !self.is_full()
    }

    /// Release `n` bytes. Returns true if this crossed back under the limit.
    pub fn release(&self, n: usize) -> bool {
        let was_full = self.is_full();
        self.in_flight.set(self.in_flight.get().saturating_sub(n));
        was_full && !self.is_full()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn is_full(&self) -> bool {
        self.limit > 0 && self.in_flight.get() >= self.limit
    }
}

/// Request of a tour.
#[derive(Debug, Default)]
pub struct TourReq {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub host: String,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
    pub content_length: Option<usize>,
    pub received: usize,
    pub ended: bool,
    pub credit: ContentCredit,
}

impl TourReq {
    /// Fill the request from a decoded head.
    pub fn apply(&mut self, head: RequestHead) {
        self.host = header_value(&head.headers, "host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
            .unwrap_or_default();
        self.method = head.method;
        self.uri = head.uri;
        self.version = head.version;
        self.headers = head.headers;
        self.content_length = head.content_length;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Path part of the URI (without query string).
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("")
    }

    pub(crate) fn reset(&mut self) {
        *self = TourReq::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_crosses_limit() {
        let credit = ContentCredit::new(10);
        assert!(credit.acquire(6));
        assert!(!credit.acquire(6));
        assert!(credit.is_full());
        assert!(!credit.release(1)); // 11 in flight, still full
        assert!(credit.release(5));
        assert_eq!(credit.in_flight(), 6);
        assert!(!credit.release(5));
    }

    #[test]
    fn credit_is_shared_between_clones() {
        let credit = ContentCredit::new(4);
        let callback_side = credit.clone();
        credit.acquire(4);
        assert!(callback_side.is_full());
        assert!(callback_side.release(4));
        assert_eq!(credit.in_flight(), 0);
    }

    #[test]
    fn apply_extracts_host_and_path() {
        let mut req = TourReq::default();
        req.apply(RequestHead {
            method: "GET".into(),
            uri: "/a/b?x=1".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "Example.COM:2020".into())],
            content_length: None,
        });
        assert_eq!(req.host, "example.com");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.header("host"), Some("Example.COM:2020"));
    }
}
