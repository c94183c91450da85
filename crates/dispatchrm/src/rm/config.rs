use std::time::Duration;

/// Cached cluster inventory older than this is refreshed on the next read.
pub const MAX_RESOURCE_DETAILS_SAMPLE_AGE: Duration = Duration::from_secs(60);

/// Launcher user that owns the inventory query dispatches.
pub const RESOURCE_QUERY_OWNER: &str = "launcher";

/// Priority of groups that never set one explicitly.
pub const DEFAULT_GROUP_PRIORITY: i32 = 50;

/// Time between two scheduling passes over pending allocation requests.
pub fn get_schedule_cooldown() -> Duration {
    get_duration_from_env("DISPATCHRM_SCHEDULE_COOLDOWN_MS").unwrap_or(Duration::from_millis(500))
}

/// How often the dispatch watcher polls the launcher.
pub fn get_poll_interval() -> Duration {
    get_duration_from_env("DISPATCHRM_POLL_INTERVAL_MS").unwrap_or(Duration::from_secs(10))
}

/// Delay between status checks while waiting for a terminated dispatch to finish.
pub fn get_terminate_wait_interval() -> Duration {
    get_duration_from_env("DISPATCHRM_TERMINATE_WAIT_INTERVAL_MS")
        .unwrap_or(Duration::from_secs(6))
}

/// How many status checks are made before cleanup proceeds anyway.
pub fn get_terminate_wait_attempts() -> u32 {
    std::env::var("DISPATCHRM_TERMINATE_WAIT_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(20)
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Clone)]
pub struct RmTimings {
    pub schedule_cooldown: Duration,
    pub poll_interval: Duration,
    pub terminate_wait_interval: Duration,
    pub terminate_wait_attempts: u32,
    pub resource_details_max_age: Duration,
}

impl RmTimings {
    pub fn from_env() -> Self {
        Self {
            schedule_cooldown: get_schedule_cooldown(),
            poll_interval: get_poll_interval(),
            terminate_wait_interval: get_terminate_wait_interval(),
            terminate_wait_attempts: get_terminate_wait_attempts(),
            resource_details_max_age: MAX_RESOURCE_DETAILS_SAMPLE_AGE,
        }
    }
}
