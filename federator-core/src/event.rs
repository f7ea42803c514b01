//! Ordered, single-consumer event stream between the core and the
//! response layer.
//!
//! Ordering rules enforced by [`EventSender`]:
//! * `Header` at most once, before the first `Data`;
//! * `End` exactly once, last.
//!
//! [`EventStream`] stops yielding `Data` once the request has been
//! cancelled, and synthesizes the `End` if the producer went away without
//! sending one.

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FederatorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FederatorEvent {
    Header,
    Data(Bytes),
    End(Option<FederatorError>),
}

/// Create a connected sender/stream pair. `cancel` is the owning request's
/// token.
pub(crate) fn channel(capacity: usize, cancel: CancellationToken) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = EventSender {
        tx,
        header_sent: false,
        ended: false,
    };
    let stream = EventStream {
        rx,
        cancel,
        finished: false,
    };
    (sender, stream)
}

// ------------------------------------------------------------------ //
//  Producer side                                                      //
// ------------------------------------------------------------------ //

/// Returned when the consumer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Disconnected;

#[derive(Debug)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<FederatorEvent>,
    header_sent: bool,
    ended: bool,
}

impl EventSender {
    /// Emit `Header` unless it already went out.
    pub(crate) async fn header(&mut self) -> Result<(), Disconnected> {
        if self.header_sent || self.ended {
            return Ok(());
        }
        self.header_sent = true;
        self.tx
            .send(FederatorEvent::Header)
            .await
            .map_err(|_| Disconnected)
    }

    /// Emit a payload chunk, preceded by `Header` the first time.
    pub(crate) async fn data(&mut self, bytes: Bytes) -> Result<(), Disconnected> {
        if self.ended {
            return Ok(());
        }
        self.header().await?;
        self.tx
            .send(FederatorEvent::Data(bytes))
            .await
            .map_err(|_| Disconnected)
    }

    /// Emit the terminal event without waiting for channel capacity. If the
    /// channel is full the consumer sees the `End` synthesized on close.
    pub(crate) fn end(&mut self, error: Option<FederatorError>) {
        if self.ended {
            return;
        }
        self.ended = true;
        let _ = self.tx.try_send(FederatorEvent::End(error));
    }
}

// ------------------------------------------------------------------ //
//  Consumer side                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<FederatorEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventStream {
    /// Next event, or `None` after `End` has been yielded.
    pub async fn recv(&mut self) -> Option<FederatorEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(FederatorEvent::Data(_)) if self.cancel.is_cancelled() => continue,
                Some(FederatorEvent::End(error)) => {
                    self.finished = true;
                    return Some(FederatorEvent::End(error));
                }
                Some(event) => return Some(event),
                None => {
                    self.finished = true;
                    return Some(FederatorEvent::End(None));
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = FederatorEvent> + Send {
        stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
