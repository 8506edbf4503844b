//! Pairs outgoing expedited SDO requests with their responses.
//!
//! The wire format carries no request identifier, so responses are matched by
//! (COB-ID, index, subindex) only and there is exactly one slot per request
//! kind. Callers must hold the kind's ticket (see `Gateway`) around
//! `begin`..`await_result`.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use canopen_common::{matches, CobIdMatch, Frame, SdoKind};
use log::{debug, warn};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTransaction {
    receiver_id: u8,
    index: u16,
    subindex: u8,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<PendingTransaction>,
    result: Option<Frame>,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Why `await_result` gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitError {
    TimedOut(Duration),
    Disconnected,
}

#[derive(Debug, Default)]
pub struct Correlator {
    write: Slot,
    read: Slot,
    cob_match: CobIdMatch,
}

impl Correlator {
    pub fn new(cob_match: CobIdMatch) -> Self {
        Self {
            cob_match,
            ..Default::default()
        }
    }

    fn slot(&self, kind: SdoKind) -> &Slot {
        match kind {
            SdoKind::Write => &self.write,
            SdoKind::Read => &self.read,
        }
    }

    /// Register a pending transaction, discarding any stale entry or result.
    pub fn begin(&self, kind: SdoKind, receiver_id: u8, index: u16, subindex: u8) {
        let mut state = self.slot(kind).lock();
        state.pending = Some(PendingTransaction {
            receiver_id,
            index,
            subindex,
            issued_at: Instant::now(),
        });
        state.result = None;
    }

    /// Store a response frame for `kind`; the last offer wins.
    pub fn offer(&self, kind: SdoKind, frame: Frame) {
        let slot = self.slot(kind);
        {
            let mut state = slot.lock();
            if state.pending.is_none() {
                debug!("Unsolicited SDO {} response {:?}", kind, frame);
            }
            state.result = Some(frame);
        }
        slot.notify.notify_one();
    }

    /// Clear both the pending transaction and any stored result.
    pub fn cancel(&self, kind: SdoKind) {
        let mut state = self.slot(kind).lock();
        state.pending = None;
        state.result = None;
    }

    pub fn is_pending(&self, kind: SdoKind) -> bool {
        self.slot(kind).lock().pending.is_some()
    }

    fn take_match(&self, kind: SdoKind, receiver_id: u8, index: u16, subindex: u8) -> Option<Frame> {
        let mut state = self.slot(kind).lock();
        let frame = state.result.take()?;
        if matches(&frame, receiver_id, index, subindex, self.cob_match) {
            state.pending = None;
            Some(frame)
        } else {
            warn!(
                "Dropping SDO {} response {:?} while waiting for node 0x{:02X} 0x{:04X}:{:02X}",
                kind, frame, receiver_id, index, subindex
            );
            None
        }
    }

    /// Wait for a matching response. The deadline runs from `begin`; the slot
    /// is cleared before returning an error so a late response cannot leak
    /// into the next transaction.
    pub async fn await_result(
        &self,
        kind: SdoKind,
        receiver_id: u8,
        index: u16,
        subindex: u8,
        timeout: Duration,
        connection: &mut watch::Receiver<ConnectionState>,
    ) -> Result<Frame, AwaitError> {
        let slot = self.slot(kind);
        let issued_at = slot.lock().pending.map(|p| p.issued_at).unwrap_or_else(Instant::now);
        let deadline = issued_at + timeout;
        let mut connection_open = true;

        loop {
            let notified = slot.notify.notified();

            if let Some(frame) = self.take_match(kind, receiver_id, index, subindex) {
                return Ok(frame);
            }
            if !connection_open || !connection.borrow_and_update().is_connected() {
                self.cancel(kind);
                return Err(AwaitError::Disconnected);
            }

            tokio::select! {
                _ = notified => {}
                changed = connection.changed() => {
                    connection_open = changed.is_ok();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.cancel(kind);
                    return Err(AwaitError::TimedOut(issued_at.elapsed()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopen_common::encode_sdo_response;
    use std::sync::Arc;

    fn ack(node: u8, index: u16, subindex: u8) -> Frame {
        encode_sdo_response(0x580 + node as u16, 0x60, index, subindex, [0; 4])
    }

    fn connected() -> (watch::Sender<ConnectionState>, watch::Receiver<ConnectionState>) {
        watch::channel(ConnectionState::Connected)
    }

    #[tokio::test]
    async fn returns_matching_frame_and_clears_slot() {
        let (_tx, mut rx) = connected();
        let correlator = Arc::new(Correlator::new(CobIdMatch::Additive));
        correlator.begin(SdoKind::Write, 2, 0x2000, 1);

        let offerer = correlator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            offerer.offer(SdoKind::Write, ack(2, 0x2000, 1));
        });

        let frame = correlator
            .await_result(SdoKind::Write, 2, 0x2000, 1, Duration::from_secs(1), &mut rx)
            .await
            .unwrap();
        assert_eq!(frame.index(), 0x2000);
        assert!(!correlator.is_pending(SdoKind::Write));
    }

    #[tokio::test]
    async fn response_already_offered_is_picked_up() {
        let (_tx, mut rx) = connected();
        let correlator = Correlator::new(CobIdMatch::Additive);
        correlator.begin(SdoKind::Read, 2, 0x2000, 1);
        correlator.offer(SdoKind::Read, ack(2, 0x2000, 1));

        let result = correlator
            .await_result(SdoKind::Read, 2, 0x2000, 1, Duration::from_millis(100), &mut rx)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timeout_is_not_early_and_not_much_late() {
        let (_tx, mut rx) = connected();
        let correlator = Correlator::new(CobIdMatch::Additive);
        let timeout = Duration::from_millis(150);
        correlator.begin(SdoKind::Read, 2, 0x2000, 1);

        let started = std::time::Instant::now();
        let result = correlator
            .await_result(SdoKind::Read, 2, 0x2000, 1, timeout, &mut rx)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(AwaitError::TimedOut(_))));
        assert!(elapsed >= timeout, "returned after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(200), "returned after {:?}", elapsed);
        assert!(!correlator.is_pending(SdoKind::Read));
    }

    #[tokio::test]
    async fn mismatched_frames_do_not_complete() {
        let (_tx, mut rx) = connected();
        let correlator = Correlator::new(CobIdMatch::Additive);
        correlator.begin(SdoKind::Write, 2, 0x2000, 1);
        correlator.offer(SdoKind::Write, ack(2, 0x2000, 2));
        correlator.offer(SdoKind::Read, ack(2, 0x2000, 1));

        let result = correlator
            .await_result(SdoKind::Write, 2, 0x2000, 1, Duration::from_millis(60), &mut rx)
            .await;
        assert!(matches!(result, Err(AwaitError::TimedOut(_))));
    }

    #[tokio::test]
    async fn late_response_does_not_leak_into_next_call() {
        let (_tx, mut rx) = connected();
        let correlator = Correlator::new(CobIdMatch::Additive);
        correlator.begin(SdoKind::Write, 2, 0x2000, 1);
        let first = correlator
            .await_result(SdoKind::Write, 2, 0x2000, 1, Duration::from_millis(20), &mut rx)
            .await;
        assert!(first.is_err());

        // response to the timed-out request arrives before the retry is issued
        correlator.offer(SdoKind::Write, ack(2, 0x2000, 1));
        correlator.begin(SdoKind::Write, 2, 0x2000, 1);
        let second = correlator
            .await_result(SdoKind::Write, 2, 0x2000, 1, Duration::from_millis(40), &mut rx)
            .await;
        assert!(matches!(second, Err(AwaitError::TimedOut(_))));
    }

    #[tokio::test]
    async fn disconnect_wakes_waiter() {
        let (tx, mut rx) = connected();
        let correlator = Correlator::new(CobIdMatch::Additive);
        correlator.begin(SdoKind::Read, 2, 0x2000, 1);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(ConnectionState::Disconnected);
        });

        let started = std::time::Instant::now();
        let result = correlator
            .await_result(SdoKind::Read, 2, 0x2000, 1, Duration::from_secs(5), &mut rx)
            .await;
        assert_eq!(result, Err(AwaitError::Disconnected));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
