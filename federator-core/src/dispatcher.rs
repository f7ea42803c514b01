//! Bounded fan-out of sub-requests over reusable work-unit lanes.
//!
//! A started [`Dispatcher`] spawns one owning task. That task holds every
//! [`WorkUnit`], the pending URL queue and the producer side of the event
//! stream; per-lane transfer tasks only report what they receive over a
//! channel, so lane state is never touched by two tasks.
//!
//! ```text
//! Idle ──start──► Running ──queue drained, all lanes idle──► Exhausted
//!                    │
//!                    └──kill / consumer gone──► Killed
//! ```
//!
//! Either terminal transition emits exactly one `End` event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::config::FederatorConfig;
use crate::error::TransportError;
use crate::event::EventSender;
use crate::query::Service;
use crate::stats::RequestStats;
use crate::transport::Transport;
use crate::work_unit::WorkUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    Exhausted,
    Killed,
}

// ------------------------------------------------------------------ //
//  Handle                                                             //
// ------------------------------------------------------------------ //

pub struct Dispatcher {
    config: Arc<FederatorConfig>,
    transport: Arc<dyn Transport>,
    service: Service,
    stats: Arc<RequestStats>,
    state: Arc<Mutex<DispatcherState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: Arc<FederatorConfig>,
        transport: Arc<dyn Transport>,
        service: Service,
        stats: Arc<RequestStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            service,
            stats,
            state: Arc::new(Mutex::new(DispatcherState::Idle)),
            cancel,
            task: None,
        }
    }

    /// Start fetching `urls`, consumed from the tail. Returns `false` and
    /// does nothing if this dispatcher was already started.
    pub(crate) fn start(&mut self, urls: Vec<String>, events: EventSender) -> bool {
        {
            let mut state = self.lock_state();
            if *state != DispatcherState::Idle {
                return false;
            }
            *state = DispatcherState::Running;
        }

        let lanes = urls.len().min(self.config.max_threads.max(1));
        let (unit_tx, unit_rx) = mpsc::channel(lanes.max(1) * 4);

        let task = DispatchTask {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            service: self.service,
            stats: Arc::clone(&self.stats),
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            pending: urls,
            units: (0..lanes).map(WorkUnit::new).collect(),
            transfers: (0..lanes).map(|_| None).collect(),
            unit_tx,
            unit_rx,
            events,
        };

        debug!(lanes, service = %self.service, "dispatcher started");
        self.task = Some(tokio::spawn(task.run().instrument(tracing::Span::current())));
        true
    }

    /// Abort every in-flight sub-request. No-op unless running.
    pub fn kill(&self) {
        {
            let mut state = self.lock_state();
            if *state != DispatcherState::Running {
                return;
            }
            *state = DispatcherState::Killed;
        }
        self.cancel.cancel();
    }

    pub fn state(&self) -> DispatcherState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ------------------------------------------------------------------ //
//  Owning task                                                        //
// ------------------------------------------------------------------ //

/// What a transfer task reports about its lane.
#[derive(Debug)]
enum UnitEvent {
    Head { lane: usize, status: u16 },
    Fragment { lane: usize, bytes: Bytes },
    Closed { lane: usize, failure: Option<String> },
}

enum Flow {
    Continue,
    Exhausted,
    Killed,
}

struct DispatchTask {
    config: Arc<FederatorConfig>,
    transport: Arc<dyn Transport>,
    service: Service,
    stats: Arc<RequestStats>,
    state: Arc<Mutex<DispatcherState>>,
    cancel: CancellationToken,
    pending: Vec<String>,
    units: Vec<WorkUnit>,
    transfers: Vec<Option<JoinHandle<()>>>,
    unit_tx: mpsc::Sender<UnitEvent>,
    unit_rx: mpsc::Receiver<UnitEvent>,
    events: EventSender,
}

impl DispatchTask {
    async fn run(mut self) {
        for lane in 0..self.units.len() {
            if let Some(url) = self.pending.pop() {
                self.open(lane, url);
            }
        }

        let mut flow = if self.units.is_empty() {
            self.exhaust()
        } else {
            Flow::Continue
        };

        while let Flow::Continue = flow {
            flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Flow::Killed,
                event = self.unit_rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => Flow::Killed,
                },
            };
        }

        if let Flow::Killed = flow {
            self.abort_all();
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = DispatcherState::Killed;
            debug!("dispatcher killed");
        }

        self.events.end(None);
    }

    fn open(&mut self, lane: usize, url: String) {
        self.units[lane].open(url.clone());
        let transfer = transfer(
            lane,
            url,
            Arc::clone(&self.transport),
            self.config.thread_timeout,
            self.unit_tx.clone(),
        );
        self.transfers[lane] = Some(tokio::spawn(transfer));
    }

    async fn handle(&mut self, event: UnitEvent) -> Flow {
        match event {
            UnitEvent::Head { lane, status } => {
                self.units[lane].set_status(status);
                Flow::Continue
            }
            UnitEvent::Fragment { lane, bytes } => {
                let unit = &mut self.units[lane];
                let kept = unit.append(&bytes);
                if kept && self.service.is_binary() && unit.buffered() > self.config.max_bytes_flush {
                    return self.flush(lane).await;
                }
                Flow::Continue
            }
            UnitEvent::Closed { lane, failure } => self.close(lane, failure).await,
        }
    }

    async fn close(&mut self, lane: usize, failure: Option<String>) -> Flow {
        self.transfers[lane] = None;

        let unit = &mut self.units[lane];
        if let Some(reason) = failure {
            unit.fail(reason);
        }
        unit.close();

        let outcome = unit.outcome();
        info!(
            lane,
            status = ?unit.status(),
            outcome = outcome.as_str(),
            bytes = unit.bytes_total(),
            host = %unit.host(),
            elapsed_ms = unit.elapsed().as_millis() as u64,
            failure = ?unit.failure(),
            "thread closed"
        );
        self.stats.record(outcome);

        if let Flow::Killed = self.flush(lane).await {
            return Flow::Killed;
        }

        if let Some(url) = self.pending.pop() {
            self.open(lane, url);
            return Flow::Continue;
        }

        if self.units.iter().all(|u| !u.is_active()) {
            return self.exhaust();
        }
        Flow::Continue
    }

    /// Release what the lane may release now; `Header` goes out first.
    async fn flush(&mut self, lane: usize) -> Flow {
        let Some(bytes) = self.units[lane].take_flushable(self.config.record_size) else {
            return Flow::Continue;
        };
        let len = bytes.len();

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.events.data(bytes) => result.is_ok(),
        };
        if !sent {
            return Flow::Killed;
        }
        self.stats.add_bytes(len);
        Flow::Continue
    }

    fn exhaust(&mut self) -> Flow {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == DispatcherState::Running {
            *state = DispatcherState::Exhausted;
            Flow::Exhausted
        } else {
            Flow::Killed
        }
    }

    fn abort_all(&mut self) {
        for (unit, transfer) in self.units.iter_mut().zip(self.transfers.iter_mut()) {
            if let Some(handle) = transfer.take() {
                handle.abort();
            }
            unit.close();
        }
    }
}

// ------------------------------------------------------------------ //
//  Transfer task                                                      //
// ------------------------------------------------------------------ //

/// Fetch one URL for `lane`, always finishing with `Closed` unless aborted.
async fn transfer(
    lane: usize,
    url: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    tx: mpsc::Sender<UnitEvent>,
) {
    let failure = stream_body(lane, &url, transport.as_ref(), timeout, &tx)
        .await
        .err()
        .map(|e| e.to_string());
    let _ = tx.send(UnitEvent::Closed { lane, failure }).await;
}

async fn stream_body(
    lane: usize,
    url: &str,
    transport: &dyn Transport,
    timeout: Duration,
    tx: &mpsc::Sender<UnitEvent>,
) -> Result<(), TransportError> {
    let response = tokio::time::timeout(timeout, transport.get(url))
        .await
        .map_err(|_| TransportError::TimedOut)??;

    let status = response.status;
    if tx.send(UnitEvent::Head { lane, status }).await.is_err() || status != 200 {
        return Ok(());
    }

    let mut body = response.body;
    loop {
        let next = tokio::time::timeout(timeout, body.next())
            .await
            .map_err(|_| TransportError::TimedOut)?;
        match next {
            None => return Ok(()),
            Some(chunk) => {
                let bytes = chunk?;
                if tx.send(UnitEvent::Fragment { lane, bytes }).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
