//! One-time broadcast used to stop a [crate::Server].
//!
//! # Example
//!
//! ```rust
//! use slotdrain_server::signal::Signaler;
//!
//! # futures::executor::block_on(async {
//! let (signaler, signal) = Signaler::new();
//! let waiter = signal.clone();
//!
//! signaler.signal(2);
//! assert_eq!(waiter.await, Ok(2));
//! assert_eq!(signal.await, Ok(2));
//! # });
//! ```

use futures::{
    channel::oneshot,
    future::{FutureExt as _, Shared},
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A future that resolves once its [Signaler] fires.
///
/// Resolves to `Err` if the [Signaler] is dropped without firing. Polling a [Signal] again after
/// it has resolved panics, so wait on a reference (`&mut signal`) in loops and stop polling once
/// it yields.
#[derive(Clone)]
pub struct Signal {
    inner: Shared<oneshot::Receiver<i32>>,
}

impl Future for Signal {
    type Output = Result<i32, oneshot::Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

/// Fires every [Signal] created alongside it.
pub struct Signaler {
    tx: oneshot::Sender<i32>,
}

impl Signaler {
    /// Create a new [Signaler].
    ///
    /// Returns a [Signaler] and a [Signal] that will resolve when [Signaler::signal] is called.
    pub fn new() -> (Self, Signal) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Signal { inner: rx.shared() })
    }

    /// Resolve all [Signal]s associated with this [Signaler].
    pub fn signal(self, value: i32) {
        let _ = self.tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_signaler() {
        let (signaler, signal) = Signaler::new();
        drop(signaler);
        assert!(signal.await.is_err());
    }

    #[tokio::test]
    async fn test_signal_many_waiters() {
        let (signaler, signal) = Signaler::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| tokio::spawn(signal.clone()))
            .collect();
        signaler.signal(9);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(9));
        }
    }
}
