/// Trait for congestion control algorithms.
///
/// Windows are counted in segments. The controller is told about
/// acknowledged segments and retransmission timeouts and answers with the
/// number of segments that may be in flight.
pub(crate) trait Controller: Send {
    /// Returns the current congestion window in segments, at least one.
    fn window(&self) -> u32;

    /// Called when `acked` previously unacknowledged segments are acknowledged.
    fn on_ack(&mut self, acked: u32);

    /// Called when a segment has to be sent again.
    fn on_timeout(&mut self);

    fn in_slow_start(&self) -> bool;

    /// Slow start threshold, unset until the first timeout.
    fn threshold(&self) -> Option<u32>;
}

/// Additive increase, multiplicative decrease.
///
/// Slow start grows the window by one segment per acknowledged segment
/// until it reaches the threshold; congestion avoidance then grows it by
/// `acked² / cwnd`. A timeout halves the window. The threshold is taken
/// from the first timeout and kept afterwards.
pub(crate) struct Aimd {
    cwnd: f64,
    threshold: Option<f64>,
    slow_start: bool,
}

impl Aimd {
    pub(crate) fn new(initial_window: u32) -> Box<Self> {
        Box::new(Self {
            cwnd: initial_window.max(1) as f64,
            threshold: None,
            slow_start: true,
        })
    }
}

impl Controller for Aimd {
    fn window(&self) -> u32 {
        (self.cwnd.floor() as u32).max(1)
    }

    fn on_ack(&mut self, acked: u32) {
        let acked = acked as f64;
        if self.slow_start {
            self.cwnd += acked;
            if let Some(threshold) = self.threshold {
                if self.cwnd >= threshold {
                    self.slow_start = false;
                }
            }
        } else {
            self.cwnd += acked * acked / self.cwnd;
        }
    }

    fn on_timeout(&mut self) {
        self.cwnd = (self.cwnd / 2.0).max(1.0);
        let threshold = *self.threshold.get_or_insert(self.cwnd);
        self.slow_start = self.cwnd < threshold;
    }

    fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    fn threshold(&self) -> Option<u32> {
        self.threshold.map(|t| t as u32)
    }
}

/// Constant window controller for tests.
#[cfg(test)]
pub(crate) struct FixedWindow(pub u32);

#[cfg(test)]
impl Controller for FixedWindow {
    fn window(&self) -> u32 {
        self.0.max(1)
    }

    fn on_ack(&mut self, _acked: u32) {}

    fn on_timeout(&mut self) {}

    fn in_slow_start(&self) -> bool {
        false
    }

    fn threshold(&self) -> Option<u32> {
        None
    }
}
