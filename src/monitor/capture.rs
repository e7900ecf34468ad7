use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Capture session phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePhase {
    Idle,
    Requested,
    Capturing,
    /// Sample received, verification in progress. Still occupies the
    /// session: a new request is rejected until verification finishes.
    Completed,
    TimedOut,
    Errored,
}

/// A capture was requested while one is already outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a capture is already in progress")]
pub struct CaptureBusy;

/// Client-side state machine for one capture request.
///
/// Deadline ticks carry the generation they were armed with; a tick whose
/// generation no longer matches is ignored, so a stale timer can never
/// time out a newer session.
#[derive(Debug)]
pub struct CaptureSession {
    phase: CapturePhase,
    request_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            phase: CapturePhase::Idle,
            request_id: None,
            started_at: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the session occupies the at-most-one-in-flight slot
    pub fn in_flight(&self) -> bool {
        matches!(
            self.phase,
            CapturePhase::Requested | CapturePhase::Capturing | CapturePhase::Completed
        )
    }

    /// Begin a new session. Rejected while one is in flight; a session
    /// left in a terminal phase (TimedOut/Errored) is replaced.
    pub fn begin(&mut self) -> Result<(Uuid, u64), CaptureBusy> {
        if self.in_flight() {
            return Err(CaptureBusy);
        }
        self.generation += 1;
        let request_id = Uuid::new_v4();
        self.request_id = Some(request_id);
        self.started_at = Some(Utc::now());
        self.phase = CapturePhase::Requested;
        Ok((request_id, self.generation))
    }

    /// Agent acknowledged the request
    pub fn mark_capturing(&mut self) -> bool {
        if self.phase == CapturePhase::Requested {
            self.phase = CapturePhase::Capturing;
            true
        } else {
            false
        }
    }

    /// A sample arrived; the session stays occupied until `reset`
    pub fn mark_completed(&mut self) -> bool {
        if matches!(self.phase, CapturePhase::Requested | CapturePhase::Capturing) {
            self.phase = CapturePhase::Completed;
            true
        } else {
            false
        }
    }

    /// Local deadline fired. Only transitions once, and only for the
    /// generation the deadline was armed with.
    pub fn mark_timed_out(&mut self, generation: u64) -> bool {
        if generation == self.generation
            && matches!(self.phase, CapturePhase::Requested | CapturePhase::Capturing)
        {
            self.phase = CapturePhase::TimedOut;
            true
        } else {
            false
        }
    }

    /// Agent reported a capture failure
    pub fn mark_errored(&mut self) -> bool {
        if matches!(self.phase, CapturePhase::Requested | CapturePhase::Capturing) {
            self.phase = CapturePhase::Errored;
            true
        } else {
            false
        }
    }

    /// Release the session slot
    pub fn reset(&mut self) {
        self.phase = CapturePhase::Idle;
        self.request_id = None;
        self.started_at = None;
    }

    /// Session teardown on stop: releases the slot and invalidates any
    /// armed deadline. Returns true if a request was abandoned.
    pub fn cancel(&mut self) -> bool {
        let was_in_flight = self.in_flight();
        self.generation += 1;
        self.reset();
        was_in_flight
    }
}
