//! Pull bytes from a connection into its slot's buffer until the connection is done.

use crate::{Connection, ConnectionBuffer, Error, Readiness, Slot};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Receives every connection that was drained to completion.
pub trait Handler: Clone + Send + Sync + 'static {
    /// Called once the peer closed the connection or went idle.
    ///
    /// The buffer has already been removed from its slot and the connection is closed once
    /// this returns.
    fn completed<C: Connection>(&self, buffer: &ConnectionBuffer<C>);
}

/// [Handler] that logs the number of bytes received on each connection.
#[derive(Clone, Debug, Default)]
pub struct Reporter;

impl Handler for Reporter {
    fn completed<C: Connection>(&self, buffer: &ConnectionBuffer<C>) {
        info!(
            peer = %buffer.peer().address(),
            received = buffer.len(),
            "received bytes"
        );
    }
}

/// Drain the connection held in `slot`, returning the number of bytes received.
///
/// Waits for the connection to become readable (without holding the slot lock), then appends
/// everything available until a probe finds nothing more. This repeats until the peer closes
/// the connection or sends nothing for `idle_timeout`. The slot is vacated and released on every
/// exit path, and `handler` is only given the buffer if draining succeeded.
pub async fn drain<C: Connection, H: Handler>(
    slot: &Slot<C>,
    handler: &H,
    idle_timeout: Duration,
) -> Result<usize, Error> {
    let result = pump(slot, idle_timeout).await;

    let mut handle = slot.lock().await;
    let buffer = handle.vacate();
    handle.release();

    let received = result?;
    if let Some(buffer) = buffer {
        handler.completed(&buffer);
    }
    Ok(received)
}

async fn pump<C: Connection>(slot: &Slot<C>, idle_timeout: Duration) -> Result<usize, Error> {
    let connection = {
        let handle = slot.lock().await;
        handle
            .buffer()
            .ok_or(Error::SlotVacant)?
            .peer()
            .connection()
            .clone()
    };

    let mut received = 0;
    loop {
        match timeout(idle_timeout, connection.ready()).await {
            Err(_) => {
                debug!(slot = slot.index(), received, "connection idle");
                return Ok(received);
            }
            Ok(Ok(Readiness::Closed)) => {
                debug!(slot = slot.index(), received, "connection closed");
                return Ok(received);
            }
            Ok(Ok(Readiness::Data)) => {}
            Ok(Err(err)) => return Err(err),
        }

        let mut handle = slot.lock().await;
        let buffer = handle.buffer_mut().ok_or(Error::SlotVacant)?;
        loop {
            let appended = buffer.append_available()?;
            if appended == 0 {
                break;
            }
            received += appended;
        }
    }
}
