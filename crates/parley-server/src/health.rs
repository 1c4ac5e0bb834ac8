//! `/health` response.

use std::time::Instant;

use serde::Serialize;

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when the registry is not answering.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Registered connections on this process.
    pub connections: usize,
    /// Users with at least one registered connection.
    pub online_users: usize,
}

/// Build a health response. `None` counters mean the registry is down.
pub fn health_check(start_time: Instant, counters: Option<(usize, usize)>) -> HealthResponse {
    let (status, (connections, online_users)) = match counters {
        Some(c) => ("ok", c),
        None => ("degraded", (0, 0)),
    };
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        online_users,
    }
}
