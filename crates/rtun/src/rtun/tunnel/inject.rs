//! Accept-like listener fed by explicit delivery of already-open streams.
//!
//! The router `put`s worker streams here after reading their header, and the
//! forwarding service drains them with `accept` as if they came from a socket
//! listener.

use tokio::sync::{mpsc, watch};

use crate::rtun::tunnel::transport::BoxedStream;

pub const INJECT_BACKLOG: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("listener closed")]
    Closed,
}

/// A `put` refused by a closed listener. Hands the stream back so the caller
/// can route it elsewhere or drop it.
#[derive(thiserror::Error)]
#[error("listener closed")]
pub struct Rejected(pub BoxedStream);

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected(..)")
    }
}

pub struct InjectListener {
    tx: mpsc::Sender<BoxedStream>,
    rx: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for InjectListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectListener")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for InjectListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectListener {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(INJECT_BACKLOG);
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    /// Hands `st` to the next `accept`. Waits while the backlog is full.
    pub async fn put(&self, st: BoxedStream) -> Result<(), Rejected> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Rejected(st));
        }

        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(st);
                    Ok(())
                }
                Err(_) => Err(Rejected(st)),
            },
            _ = closed.wait_for(|c| *c) => Err(Rejected(st)),
        }
    }

    pub async fn accept(&self) -> Result<BoxedStream, InjectError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            if let Ok(mut rx) = self.rx.try_lock() {
                drain(&mut rx);
            }
            return Err(InjectError::Closed);
        }

        let mut rx = self.rx.lock().await;
        let res = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(InjectError::Closed),
            st = rx.recv() => st.ok_or(InjectError::Closed),
        };
        // `close` cannot drain while this call holds the receiver.
        if res.is_err() {
            drain(&mut rx);
        }
        res
    }

    /// Stops the listener. Pending and future `put`/`accept` calls fail, and
    /// streams still in the backlog are dropped.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Ok(mut rx) = self.rx.try_lock() {
            drain(&mut rx);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn drain(rx: &mut mpsc::Receiver<BoxedStream>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}
