//! Sliding-window credit tracking for the feeder, §4.3 of the spec.
//!
//! `WindowManager` has no I/O and no async dependency; it is driven
//! synchronously by the feeder as Frames are sent and Results/WindowUpdates
//! arrive, which keeps the credit bookkeeping trivially testable.

/// Tracks how many Frames are in flight (sent, result not yet received)
/// against the connection's current window size.
#[derive(Debug, Default)]
pub struct WindowManager {
    window_size: u32,
    inflight: u32,
    frames_sent: u64,
    results_received: u64,
}

impl WindowManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the starting window from the worker's `InitOk.chosen.initial_credits`,
    /// coercing 0 (and any other non-positive value) up to 1 per the spec's
    /// decision on the initial_credits=0 open question.
    pub fn initialize(&mut self, initial_credits: u32) {
        self.window_size = initial_credits.max(1);
        self.inflight = 0;
    }

    pub fn has_credits(&self) -> bool {
        self.inflight < self.window_size
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn inflight(&self) -> u32 {
        self.inflight
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn results_received(&self) -> u64 {
        self.results_received
    }

    /// Records that a Frame was sent. Callers must check [`Self::has_credits`]
    /// first; this does not itself refuse to exceed the window.
    pub fn on_frame_sent(&mut self) {
        self.inflight += 1;
        self.frames_sent += 1;
    }

    pub fn on_result_received(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        self.results_received += 1;
    }

    /// Applies an authoritative absolute window size. Does not touch
    /// `inflight`; if the new size is smaller than the current inflight
    /// count, no new frames will be sendable until enough Results drain.
    pub fn on_window_update(&mut self, new_size: u32) {
        self.window_size = new_size.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_coerces_zero_to_one() {
        let mut w = WindowManager::new();
        w.initialize(0);
        assert_eq!(w.window_size(), 1);
    }

    #[test]
    fn credits_gate_sending() {
        let mut w = WindowManager::new();
        w.initialize(2);
        assert!(w.has_credits());
        w.on_frame_sent();
        assert!(w.has_credits());
        w.on_frame_sent();
        assert!(!w.has_credits());
    }

    #[test]
    fn result_frees_a_credit() {
        let mut w = WindowManager::new();
        w.initialize(1);
        w.on_frame_sent();
        assert!(!w.has_credits());
        w.on_result_received();
        assert!(w.has_credits());
    }

    #[test]
    fn window_update_does_not_touch_inflight() {
        let mut w = WindowManager::new();
        w.initialize(2);
        w.on_frame_sent();
        w.on_frame_sent();
        w.on_window_update(5);
        assert_eq!(w.inflight(), 2);
        assert_eq!(w.window_size(), 5);
        assert!(w.has_credits());
    }

    #[test]
    fn window_update_below_inflight_blocks_until_drained() {
        let mut w = WindowManager::new();
        w.initialize(3);
        w.on_frame_sent();
        w.on_frame_sent();
        w.on_frame_sent();
        w.on_window_update(1);
        assert!(!w.has_credits());
        w.on_result_received();
        w.on_result_received();
        assert!(w.has_credits());
    }

    #[test]
    fn credit_conservation_over_a_trace() {
        // P3: frames_sent - results_received == inflight_final - inflight_initial
        let mut w = WindowManager::new();
        w.initialize(4);
        let inflight_initial = w.inflight();
        w.on_frame_sent();
        w.on_frame_sent();
        w.on_frame_sent();
        w.on_result_received();
        let inflight_final = w.inflight();
        assert_eq!(
            w.frames_sent() as i64 - w.results_received() as i64,
            inflight_final as i64 - inflight_initial as i64
        );
    }
}
