//! Process-wide configuration of the kernel-bypass transport.
//!
//! The accelerated transport reads its configuration from environment variables when it is
//!  loaded, so these knobs are process state rather than socket state. Setting environment
//!  variables is not thread safe, which is why [init_accelerator_environment] is an explicit
//!  startup step: call it from `main` before any other thread is spawned. Creating a socket
//!  never touches the environment.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::tuning::TuningProfile;

const TCP_STREAM_RX_SIZE: u32 = 16 * 1024 * 1024;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The environment variables that configure the accelerated transport for a given profile.
pub fn accelerator_environment(profile: &TuningProfile) -> Vec<(&'static str, String)> {
    let mut result = Vec::new();
    let mut set = |name: &'static str, value: String| result.push((name, value));

    if profile.use_socketxtreme {
        set("VMA_SOCKETXTREME", "1".to_string());
    }
    let spec = if profile.optimize_for_latency { "latency" } else { "throughput" };
    set("VMA_SPEC", spec.to_string());

    if profile.use_polling {
        set("VMA_RX_POLL", "1".to_string());
        set("VMA_SELECT_POLL", "1".to_string());
        if profile.disable_poll_yield {
            set("VMA_RX_POLL_YIELD", "0".to_string());
        }
        if profile.skip_os_select {
            set("VMA_SELECT_SKIP_OS", "1".to_string());
        }
    }

    if profile.ring_count > 0 {
        set("VMA_RING_ALLOCATION_LOGIC_RX", profile.ring_count.to_string());
    }

    if profile.use_socketxtreme {
        set("VMA_RING_ALLOCATION_LOGIC_TX", "0".to_string());
        set("VMA_THREAD_MODE", "1".to_string());
        if profile.keep_qp_full {
            set("VMA_CQ_KEEP_QP_FULL", "1".to_string());
        }
    }
    else {
        set("VMA_THREAD_MODE", "3".to_string());
    }

    if profile.use_hugepages {
        set("VMA_MEMORY_ALLOCATION_TYPE", "2".to_string());
    }
    if profile.tx_bufs > 0 {
        set("VMA_TX_BUFS", profile.tx_bufs.to_string());
    }
    if profile.rx_bufs > 0 {
        set("VMA_RX_BUFS", profile.rx_bufs.to_string());
    }

    if !profile.cpu_cores.is_empty() {
        set("VMA_THREAD_AFFINITY", "1".to_string());
        let cores = profile.cpu_cores.iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        set("VMA_THREAD_AFFINITY_ID", cores);
    }

    set("VMA_TCP_STREAM_RX_SIZE", TCP_STREAM_RX_SIZE.to_string());
    set("VMA_TCP_RX_ZERO_COPY", "1".to_string());

    if profile.enable_timestamps {
        set("VMA_TIMESTAMP", "1".to_string());
    }

    result
}

/// Exports the profile's transport knobs to the process environment. Only the first call has
///  an effect, returning `true`; all later calls return `false` without touching anything.
pub fn init_accelerator_environment(profile: &TuningProfile) -> bool {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        debug!("accelerator environment already initialized - ignoring");
        return false;
    }

    let knobs = accelerator_environment(profile);
    for (name, value) in &knobs {
        debug!("{}={}", name, value);
        std::env::set_var(name, value);
    }
    info!("initialized accelerator environment ({} settings)", knobs.len());
    true
}
