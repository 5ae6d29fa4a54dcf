use std::time::Duration;

/// Tunables shared by every host simulated on a worker.
///
/// The defaults match a plain ethernet-like link: 1460 byte segments,
/// a 10 ms governor batch and a one second incoming burst allowance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum payload carried by a single segment, in bytes.
    pub mss: usize,
    /// Congestion window a new connection starts with, in segments.
    pub initial_window: u32,
    /// Send buffer capacity used when autotuning is off, in bytes.
    pub send_buffer: usize,
    /// Receive buffer capacity used when autotuning is off, in bytes.
    pub recv_buffer: usize,
    /// Size buffers from round trip time and bottleneck bandwidth.
    pub autotune: bool,
    /// Buffer capacity granted to loopback connections.
    pub loopback_buffer: usize,
    /// Upper bound on the transmission time a governor tick may consume.
    pub batch: Duration,
    /// Idle time after which a governor loop disarms itself.
    pub idle_disarm: Duration,
    /// Incoming queue capacity, expressed as time at download bandwidth.
    pub incoming_burst: Duration,
    /// Safety-net poll tick; `None` disables it.
    pub poll_interval: Option<Duration>,
    /// Delay before a notification re-arms after firing.
    pub notify_rearm: Duration,
    /// Delayed ACK timeout; `None` acknowledges every segment at once.
    pub delayed_ack: Option<Duration>,
    /// Seed for the reliability draws.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1460,
            initial_window: 10,
            send_buffer: 128 * 1024,
            recv_buffer: 256 * 1024,
            autotune: true,
            loopback_buffer: 4 * 1024 * 1024,
            batch: Duration::from_millis(10),
            idle_disarm: Duration::from_millis(1),
            incoming_burst: Duration::from_secs(1),
            poll_interval: Some(Duration::from_secs(1)),
            notify_rearm: Duration::from_millis(1),
            delayed_ack: Some(Duration::from_millis(1)),
            seed: 1,
        }
    }
}

/// Advertised host bandwidth in KiB/s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bandwidth {
    pub up_kibps: u64,
    pub down_kibps: u64,
}

impl Bandwidth {
    pub fn new(up_kibps: u64, down_kibps: u64) -> Self {
        Self {
            up_kibps,
            down_kibps,
        }
    }

    pub fn symmetric(kibps: u64) -> Self {
        Self::new(kibps, kibps)
    }
}
