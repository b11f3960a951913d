pub mod accelerator_env;

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::bail;

/// TCP keepalive probing for stream sockets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeepaliveConfig {
    /// idle time before the first probe is sent
    pub idle: Duration,
    pub interval: Duration,
    /// number of unanswered probes before the connection is considered dead
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 5,
        }
    }
}

/// Settings that are applied once when a socket is created, plus the knobs for the accelerated
///  transport (see [accelerator_env]). Changing a profile has no effect on existing sockets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TuningProfile {
    pub use_socketxtreme: bool,
    /// `false` tunes the accelerated transport for throughput
    pub optimize_for_latency: bool,
    /// busy-poll instead of sleeping in the kernel; also puts sockets into non-blocking mode
    pub use_polling: bool,
    pub non_blocking: bool,
    pub ring_count: u32,
    /// SO_SNDBUF / SO_RCVBUF in bytes, 0 leaves the OS default in place
    pub buffer_size: usize,
    pub enable_timestamps: bool,
    pub use_hugepages: bool,
    pub tx_bufs: u32,
    pub rx_bufs: u32,
    pub disable_poll_yield: bool,
    pub skip_os_select: bool,
    pub keep_qp_full: bool,
    /// CPU cores for the transport's internal thread, empty for no affinity
    pub cpu_cores: Vec<u32>,

    pub tcp_nodelay: bool,
    pub tcp_keepalive: Option<KeepaliveConfig>,
}

impl Default for TuningProfile {
    fn default() -> Self {
        TuningProfile {
            use_socketxtreme: true,
            optimize_for_latency: true,
            use_polling: true,
            non_blocking: false,
            ring_count: 4,
            buffer_size: 64 * 1024,
            enable_timestamps: true,
            use_hugepages: false,
            tx_bufs: 0,
            rx_bufs: 0,
            disable_poll_yield: false,
            skip_os_select: false,
            keep_qp_full: false,
            cpu_cores: Vec::new(),
            tcp_nodelay: true,
            tcp_keepalive: Some(KeepaliveConfig::default()),
        }
    }
}

impl TuningProfile {
    pub fn low_latency() -> TuningProfile {
        TuningProfile {
            disable_poll_yield: true,
            skip_os_select: true,
            ..Default::default()
        }
    }

    pub fn high_throughput() -> TuningProfile {
        TuningProfile {
            use_polling: false,
            optimize_for_latency: false,
            ring_count: 8,
            buffer_size: 4 * 1024 * 1024,
            use_hugepages: true,
            tx_bufs: 10_000,
            rx_bufs: 10_000,
            keep_qp_full: true,
            ..Default::default()
        }
    }

    /// Plain blocking sockets with small buffers, i.e. what an untuned socket would do
    pub fn conservative() -> TuningProfile {
        TuningProfile {
            use_socketxtreme: false,
            use_polling: false,
            ring_count: 1,
            buffer_size: 4096,
            enable_timestamps: false,
            ..Default::default()
        }
    }

    pub fn wants_nonblocking(&self) -> bool {
        self.use_polling || self.non_blocking
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size > i32::MAX as usize {
            bail!("buffer size {} does not fit into a socket option", self.buffer_size);
        }
        if self.ring_count > 64 {
            bail!("ring count must be at most 64, was {}", self.ring_count);
        }
        if let Some(keepalive) = &self.tcp_keepalive {
            if keepalive.interval.is_zero() {
                bail!("keepalive interval must be non-zero");
            }
            if keepalive.retries == 0 {
                bail!("keepalive retries must be > 0");
            }
        }
        let distinct = self.cpu_cores.iter().collect::<BTreeSet<_>>();
        if distinct.len() != self.cpu_cores.len() {
            bail!("duplicate entries in cpu core list {:?}", self.cpu_cores);
        }
        Ok(())
    }
}
