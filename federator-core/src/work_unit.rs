//! One dispatcher lane: the state of the sub-request it is currently serving.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

/// How a finished sub-request is tallied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// HTTP 200.
    Success,
    /// HTTP 204.
    NoData,
    /// Any other status, a timeout or a transport error.
    Failed,
}

impl UnitOutcome {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(200) => UnitOutcome::Success,
            Some(204) => UnitOutcome::NoData,
            _ => UnitOutcome::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitOutcome::Success => "success",
            UnitOutcome::NoData => "empty",
            UnitOutcome::Failed => "failed",
        }
    }
}

/// A reusable pool slot. Reset by [`WorkUnit::open`] for every URL it
/// serves; [`WorkUnit::close`] keeps the last status for logging.
#[derive(Debug)]
pub struct WorkUnit {
    lane: usize,
    url: String,
    active: bool,
    started: Instant,
    bytes_total: usize,
    buffer: BytesMut,
    status: Option<u16>,
    failure: Option<String>,
}

impl WorkUnit {
    pub fn new(lane: usize) -> Self {
        Self {
            lane,
            url: String::new(),
            active: false,
            started: Instant::now(),
            bytes_total: 0,
            buffer: BytesMut::new(),
            status: None,
            failure: None,
        }
    }

    pub fn open(&mut self, url: String) {
        self.url = url;
        self.active = true;
        self.started = Instant::now();
        self.bytes_total = 0;
        self.buffer.clear();
        self.status = None;
        self.failure = None;
    }

    pub fn close(&mut self) {
        self.active = false;
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Buffer a body fragment. Fragments of unsuccessful responses are
    /// ignored; returns whether the fragment was kept.
    pub fn append(&mut self, fragment: &[u8]) -> bool {
        if self.status != Some(200) {
            return false;
        }
        self.bytes_total += fragment.len();
        self.buffer.extend_from_slice(fragment);
        true
    }

    /// Bytes received but not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes received over the lifetime of the current sub-request.
    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    /// Take the bytes that may be released now.
    ///
    /// While the unit is active only whole records leave the buffer; once it
    /// is closed the remainder goes out regardless of alignment.
    pub fn take_flushable(&mut self, record_size: usize) -> Option<Bytes> {
        let n = if self.active {
            self.buffer.len() - self.buffer.len() % record_size.max(1)
        } else {
            self.buffer.len()
        };
        if n == 0 {
            return None;
        }
        Some(self.buffer.split_to(n).freeze())
    }

    /// Mark the sub-request as failed and drop anything not yet flushed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.buffer.clear();
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn outcome(&self) -> UnitOutcome {
        if self.failure.is_some() {
            UnitOutcome::Failed
        } else {
            UnitOutcome::from_status(self.status)
        }
    }

    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
