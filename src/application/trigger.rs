//! Per-camera forward decisions.
//!
//! Auto mode forwards arriving frames subject to the frame-rate cap; frames
//! that arrive too early or while an inference is running are dropped, never
//! queued. Snapshot mode forwards only on triggers; triggers that land while
//! an inference is running are folded into a bounded pending count (one by
//! default, so the latest trigger wins).

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::camera::{Camera, CameraMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub mode: CameraMode,
    pub min_interval: Duration,
    pub delay: Duration,
    pub pending_limit: usize,
}

impl TriggerPolicy {
    pub fn for_camera(camera: &Camera, pending_limit: usize) -> Self {
        Self {
            mode: camera.mode,
            min_interval: camera.min_frame_interval(),
            delay: camera.trigger_delay(),
            pending_limit: pending_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Nothing in flight: capture and forward now.
    Fire,
    /// Queued behind the in-flight inference.
    Pending,
    /// Merged into an already pending trigger.
    Coalesced,
    /// Auto-mode cameras do not take triggers.
    Ignored,
}

#[derive(Debug)]
pub struct TriggerController {
    policy: TriggerPolicy,
    last_forward: Option<Instant>,
    in_flight: bool,
    pending: usize,
}

impl TriggerController {
    pub fn new(policy: TriggerPolicy) -> Self {
        Self { policy, last_forward: None, in_flight: false, pending: 0 }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    /// Whether a frame arriving at `now` should be forwarded in auto mode.
    pub fn accept_frame(&self, now: Instant) -> bool {
        if self.policy.mode != CameraMode::Auto || self.in_flight {
            return false;
        }
        match self.last_forward {
            Some(last) => now.saturating_duration_since(last) >= self.policy.min_interval,
            None => true,
        }
    }

    pub fn on_trigger(&mut self) -> TriggerDecision {
        if self.policy.mode == CameraMode::Auto {
            return TriggerDecision::Ignored;
        }
        if !self.in_flight && self.pending == 0 {
            return TriggerDecision::Fire;
        }
        if self.pending < self.policy.pending_limit {
            self.pending += 1;
            TriggerDecision::Pending
        } else {
            TriggerDecision::Coalesced
        }
    }

    pub fn begin(&mut self, now: Instant) {
        self.in_flight = true;
        self.last_forward = Some(now);
    }

    /// Marks the in-flight inference finished. Returns `true` when a pending
    /// trigger should run next.
    pub fn complete(&mut self) -> bool {
        self.in_flight = false;
        if self.pending > 0 {
            self.pending -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending = 0;
    }
}
