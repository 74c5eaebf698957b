// src/recovery.rs
//! Device-loss state machine.
//!
//! `Healthy -> LossDetected -> Recovering -> Healthy`. Loss events arrive on
//! a channel whose sender is handed to the device at creation; the frame loop
//! drains it at frame boundaries with [`ContextLossRecovery::poll`]. Every
//! device gets a fresh channel, so a late event from a replaced device never
//! reaches its successor.

use crossbeam::channel::{unbounded, TryRecvError};

use crate::gpu::{DeviceLossReceiver, DeviceLossSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Healthy,
    LossDetected,
    Recovering,
}

#[derive(Debug)]
pub struct ContextLossRecovery {
    state: RecoveryState,
    receiver: Option<DeviceLossReceiver>,
    loss_count: u64,
    recoveries: u64,
    last_reason: Option<String>,
}

impl Default for ContextLossRecovery {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLossRecovery {
    pub fn new() -> Self {
        Self {
            state: RecoveryState::Healthy,
            receiver: None,
            loss_count: 0,
            recoveries: 0,
            last_reason: None,
        }
    }

    /// Open a channel for the next device. The previous one is dropped.
    pub fn arm(&mut self) -> DeviceLossSender {
        let (tx, rx) = unbounded();
        self.receiver = Some(rx);
        tx
    }

    #[inline]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.state == RecoveryState::Healthy
    }

    /// Drain pending loss events. Returns `true` when the device is not
    /// healthy afterwards.
    pub fn poll(&mut self) -> bool {
        let mut disconnected = false;
        if let Some(rx) = &self.receiver {
            let mut reason = None;
            loop {
                match rx.try_recv() {
                    Ok(event) => reason = Some(event.reason),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            if let Some(reason) = reason {
                self.signal_loss(&reason);
            }
        }
        if disconnected {
            // The device side hung up; only a dead device drops its sender.
            self.receiver = None;
        }
        !self.is_healthy()
    }

    /// Record a loss seen directly (e.g. a `ContextLost` error mid-frame).
    /// Ignored while a loss is already being handled.
    pub fn signal_loss(&mut self, reason: &str) {
        if self.state != RecoveryState::Healthy {
            log::debug!("ContextLossRecovery: loss already in progress, ignoring `{reason}`");
            return;
        }
        self.state = RecoveryState::LossDetected;
        self.loss_count += 1;
        self.last_reason = Some(reason.to_owned());
        log::error!("GPU device lost ({} so far): {reason}", self.loss_count);
    }

    /// Teardown is done; a new device is being requested.
    pub fn begin_recovery(&mut self) {
        if self.state == RecoveryState::LossDetected {
            self.state = RecoveryState::Recovering;
        }
    }

    pub fn complete_recovery(&mut self) {
        if self.state == RecoveryState::Recovering {
            self.state = RecoveryState::Healthy;
            self.recoveries += 1;
            log::info!("GPU device recovered (recovery #{})", self.recoveries);
        }
    }

    #[inline]
    pub fn loss_count(&self) -> u64 {
        self.loss_count
    }

    #[inline]
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceLostEvent;

    fn lost(reason: &str) -> DeviceLostEvent {
        DeviceLostEvent {
            reason: reason.into(),
        }
    }

    #[test]
    fn channel_event_moves_through_every_state() {
        let mut recovery = ContextLossRecovery::new();
        let tx = recovery.arm();
        assert!(!recovery.poll());

        tx.send(lost("driver reset")).unwrap();
        assert!(recovery.poll());
        assert_eq!(recovery.state(), RecoveryState::LossDetected);
        assert_eq!(recovery.last_reason(), Some("driver reset"));

        recovery.begin_recovery();
        assert_eq!(recovery.state(), RecoveryState::Recovering);
        recovery.complete_recovery();
        assert!(recovery.is_healthy());
        assert_eq!((recovery.loss_count(), recovery.recoveries()), (1, 1));
    }

    #[test]
    fn repeated_signals_count_once() {
        let mut recovery = ContextLossRecovery::new();
        let tx = recovery.arm();
        tx.send(lost("a")).unwrap();
        tx.send(lost("b")).unwrap();
        recovery.poll();
        recovery.signal_loss("c");
        assert_eq!(recovery.loss_count(), 1);
        assert_eq!(recovery.last_reason(), Some("b"));
    }

    #[test]
    fn events_from_a_replaced_device_are_ignored() {
        let mut recovery = ContextLossRecovery::new();
        let old = recovery.arm();
        let _new = recovery.arm();
        // The old receiver is gone, so the send fails and nothing is seen.
        assert!(old.send(lost("stale")).is_err());
        assert!(!recovery.poll());
    }

    #[test]
    fn complete_without_begin_is_ignored() {
        let mut recovery = ContextLossRecovery::new();
        recovery.signal_loss("x");
        recovery.complete_recovery();
        assert_eq!(recovery.state(), RecoveryState::LossDetected);
    }
}
