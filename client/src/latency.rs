use std::time::Duration;

use metriken::AtomicHistogram;

/// Client latency histograms (nanoseconds). Not globally registered.
///
/// `connect` covers the TCP connect, TLS handshake and HTTP/2 preface.
/// `request` runs from sending HEADERS to receiving the final response
/// headers.
pub struct ClientLatency {
    connect: AtomicHistogram,
    request: AtomicHistogram,
}

impl ClientLatency {
    pub(crate) fn new() -> Self {
        Self {
            connect: AtomicHistogram::new(7, 64),
            request: AtomicHistogram::new(7, 64),
        }
    }

    pub fn connect(&self) -> &AtomicHistogram {
        &self.connect
    }

    pub fn request(&self) -> &AtomicHistogram {
        &self.request
    }

    pub(crate) fn record_connect(&self, elapsed: Duration) {
        let _ = self.connect.increment(elapsed.as_nanos() as u64);
    }

    pub(crate) fn record_request(&self, elapsed: Duration) {
        let _ = self.request.increment(elapsed.as_nanos() as u64);
    }
}

impl Default for ClientLatency {
    fn default() -> Self {
        Self::new()
    }
}
