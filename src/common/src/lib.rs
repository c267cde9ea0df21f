pub mod config;
pub mod dynamic_config;
pub mod hexify;
pub mod metrics;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ShutdownMessage {
    // only use in initialize.
    Init,
    Cancel(String),
}

/// Best-effort node name for metric labels.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| fs_err::read_to_string("/proc/sys/kernel/hostname").map(|s| s.trim().to_string()))
        .unwrap_or_else(|_| "localhost".to_string())
}
