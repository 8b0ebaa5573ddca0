//! Tokio timer driver.
//!
//! The core is synchronous: every wait is a queued [`TimerEvent`] and
//! every transmission lands in the stack's outbox. This driver is the
//! thin async shim for deployments running on tokio: it sleeps until
//! the next deadline, advances the stack clock, and hands outbound
//! datagrams to the caller's sink.
//!
//! [`TimerEvent`]: super::TimerEvent

use crate::stack::{CoreStack, OutboundMessage};

/// Drive the stack's timers until no timer remains armed.
///
/// `transmit` receives every datagram the stack emits while timers
/// fire (retransmissions, standalone acks). Inbound traffic is the
/// caller's concern: feed it to [`CoreStack::on_datagram`] between
/// invocations, or select over this future and the receive path.
pub async fn run_until_idle<F>(stack: &mut CoreStack, mut transmit: F)
where
    F: FnMut(OutboundMessage),
{
    while let Some(deadline) = stack.next_deadline() {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        // Advance the virtual clock to the deadline that was slept on;
        // wall-clock skew past it is picked up by the next iteration.
        stack.advance_to(deadline);
        while let Some(out) = stack.poll_transmit() {
            transmit(out);
        }
    }
    tracing::debug!("Timer driver idle: no timers armed");
}
