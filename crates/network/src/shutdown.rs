//! Process-wide shutdown state
//!
//! A single [`Shutdown`] owns the state; every background task holds a
//! [`ShutdownListener`] and stops at its next suspension point once the
//! state leaves `Running`.

use tokio::sync::watch;

/// Node lifecycle. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Closing,
    Terminated,
}

/// Owner of the shutdown state
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<ShutdownState>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownState::Running);
        Self { tx }
    }

    pub fn state(&self) -> ShutdownState {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Running -> Closing. Returns false if shutdown was already under way.
    pub fn trigger(&self) -> bool {
        self.advance(ShutdownState::Closing)
    }

    /// Move to Terminated
    pub fn terminate(&self) {
        self.advance(ShutdownState::Terminated);
    }

    fn advance(&self, next: ShutdownState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Cancellation handle held by background tasks
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownState>,
}

impl ShutdownListener {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != ShutdownState::Running
    }

    /// Resolves once shutdown has been triggered. Also resolves if the
    /// owning [`Shutdown`] is dropped.
    pub async fn cancelled(&mut self) {
        while *self.rx.borrow_and_update() == ShutdownState::Running {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
