//! GPU submission queue and fence bookkeeping.
//!
//! The guest driver blocks on fences, so the one non-negotiable rule is:
//! every submission's `signal_fence` is completed back to the CPU worker
//! exactly once, whatever happens to the GPU worker. The tracker is pure
//! state; the supervisor performs the actual posts and feeds outcomes back
//! in, which keeps the liveness logic trivially testable.
//!
//! Completion order across a submission's possible fates is FIFO: oldest
//! dropped entries first, then drained entries in queue order, then
//! in-flight entries in forward order on termination, then whatever was
//! still pending.

use std::collections::{BTreeMap, VecDeque};

use aero_protocol::aerogpu::{GuestSubmit, SubmitAerogpu};

/// Queue cap while the GPU worker is unavailable. Beyond this the oldest
/// submissions are shed with their fences force-completed, trading lost
/// rendering for a guest that keeps running.
pub const PENDING_SUBMISSION_CAP: usize = 256;

/// Outcome of accepting one guest submission.
#[derive(Debug)]
pub enum SubmitAction {
    /// GPU not ready: the submission was queued. `completed` holds fences
    /// of entries shed from the front of the queue, in age order; each must
    /// be completed to the CPU worker immediately.
    Queued { completed: Vec<u64> },
    /// GPU ready: forward this message (the fence is now tracked as
    /// in-flight under `msg.request_id`).
    Forward(SubmitAerogpu),
}

#[derive(Debug)]
pub struct GpuSubmissionTracker {
    cap: usize,
    pending: VecDeque<GuestSubmit>,
    /// request_id -> signal_fence. Request ids are allocated monotonically,
    /// so iteration order is forward order.
    in_flight: BTreeMap<u64, u64>,
    next_request_id: u64,
}

impl Default for GpuSubmissionTracker {
    fn default() -> Self {
        Self::new(PENDING_SUBMISSION_CAP)
    }
}

impl GpuSubmissionTracker {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0);
        Self { cap, pending: VecDeque::new(), in_flight: BTreeMap::new(), next_request_id: 1 }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Accepts one submission from the CPU worker.
    pub fn on_guest_submit(&mut self, submit: GuestSubmit, gpu_ready: bool) -> SubmitAction {
        if !gpu_ready {
            self.pending.push_back(submit);
            let mut completed = Vec::new();
            while self.pending.len() > self.cap {
                // Unwrap is fine: len > cap > 0.
                let shed = self.pending.pop_front().unwrap();
                completed.push(shed.signal_fence);
            }
            return SubmitAction::Queued { completed };
        }
        SubmitAction::Forward(self.track(&submit))
    }

    fn track(&mut self, submit: &GuestSubmit) -> SubmitAerogpu {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight.insert(request_id, submit.signal_fence);
        SubmitAerogpu::new(request_id, submit)
    }

    /// Drains the queue when the GPU worker reports ready, in queue order.
    pub fn drain_pending(&mut self) -> Vec<SubmitAerogpu> {
        let pending: Vec<GuestSubmit> = self.pending.drain(..).collect();
        pending.iter().map(|submit| self.track(submit)).collect()
    }

    /// Returns the fence to complete, or `None` for a stale request id
    /// (post-restart completion, duplicate, or a different protocol epoch).
    pub fn on_submit_complete(&mut self, request_id: u64) -> Option<u64> {
        self.in_flight.remove(&request_id)
    }

    /// Both the transfer-list retry and the copy fallback failed; the
    /// submission never reached the GPU worker. Untracks it and returns the
    /// fence to force-complete.
    pub fn on_forward_failed(&mut self, request_id: u64) -> Option<u64> {
        self.in_flight.remove(&request_id)
    }

    /// GPU worker is gone: every tracked fence is completed on its behalf.
    /// In-flight entries first (forward order), then still-pending entries
    /// (queue order). Leaves the tracker empty.
    pub fn on_gpu_terminated(&mut self) -> Vec<u64> {
        let mut fences: Vec<u64> = std::mem::take(&mut self.in_flight).into_values().collect();
        fences.extend(self.pending.drain(..).map(|s| s.signal_fence));
        fences
    }
}
