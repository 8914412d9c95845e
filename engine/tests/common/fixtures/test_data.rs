//! Common test data and constants

use std::time::Duration;

use engine::config::TransportConfig;
use engine::rpc::{TaskRecord, TaskStatus};

pub mod credentials {
    pub const USERNAME: &str = "root";
    pub const PASSWORD: &str = "xenroot";
}

pub mod refs {
    pub const POOL: &str = "OpaqueRef:pool-1";
    pub const HOST: &str = "OpaqueRef:host-1";
    pub const VM: &str = "OpaqueRef:vm-1";
    pub const TASK: &str = "OpaqueRef:task-1";
}

/// Poll often enough that tests finish quickly
pub const FAST_POLL: Duration = Duration::from_millis(10);

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_transport_config() -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(10),
        stop_timeout: Duration::from_secs(2),
        unclaimed_timeout: Duration::from_secs(10),
    }
}

pub fn pending(progress: f64) -> TaskRecord {
    record(TaskStatus::Pending, progress)
}

pub fn success(result: &str) -> TaskRecord {
    TaskRecord {
        result: result.to_string(),
        ..record(TaskStatus::Success, 1.0)
    }
}

pub fn failure(error_info: &[&str]) -> TaskRecord {
    TaskRecord {
        error_info: error_info.iter().map(|s| s.to_string()).collect(),
        ..record(TaskStatus::Failure, 1.0)
    }
}

pub fn record(status: TaskStatus, progress: f64) -> TaskRecord {
    TaskRecord {
        status,
        progress,
        result: String::new(),
        error_info: Vec::new(),
        other_config: Default::default(),
    }
}

/// Spins until `condition` holds or `timeout` passes
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
