//! The flow gate (C2): a single bit of per-connection back-pressure state,
//! signaled by the transport's `pause_writing`/`resume_writing` callbacks
//! and awaited before every write (§9 Design Notes: the gate is widened to
//! cover all writes, not just `sendfile`, resolving the inconsistency the
//! spec flagged).

use tokio::sync::watch;

/// Binary writable/paused latch. Initial state is writable, matching
/// `H1Connection.connection_made` in the donor implementation, which sets
/// `ready_write` immediately on connect.
#[derive(Debug, Clone)]
pub(crate) struct FlowGate {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl FlowGate {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        FlowGate { tx, rx }
    }

    /// Transport callback: the write buffer is over the high-water mark.
    pub(crate) fn pause(&self) {
        let _ = self.tx.send(false);
    }

    /// Transport callback: the write buffer has drained below the
    /// high-water mark.
    pub(crate) fn resume(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns immediately if writable; otherwise suspends until `resume`.
    pub(crate) async fn await_writable(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender dropped; treat as permanently writable rather than
                // hang forever on a connection that's already gone.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writable_from_construction() {
        let gate = FlowGate::new();
        tokio::time::timeout(Duration::from_millis(50), gate.await_writable())
            .await
            .expect("await_writable should return immediately");
    }

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let gate = FlowGate::new();
        gate.pause();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.await_writable().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish after resume")
            .unwrap();
    }
}
