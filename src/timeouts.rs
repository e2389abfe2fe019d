//! Centralized timeout, grace and port defaults for the monitor and its
//! providers.
//!
//! Settings fall back to these values when a field is omitted, so the
//! provider state machines and the configuration layer agree on one set of
//! numbers.

use std::time::Duration;

/// Deadline for the initial bootstrap to produce a usable map.
pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-node deadline for a single configuration request or stream chunk.
pub const CONFIG_NODE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause before consulting the next provider when a map is already held.
pub const GRACE_NEXT_PROVIDER: Duration = Duration::from_millis(10);
/// Minimum spacing between the end of one refresh cycle and the next.
pub const GRACE_NEXT_CYCLE: Duration = Duration::from_secs(1);
/// Idle time after which a paused streaming connection is closed.
pub const HTTP_STREAM_TIME: Duration = Duration::from_secs(10);
/// Window in which repeated throttled refresh requests are deferred.
pub const REFRESH_THROTTLE_DELAY: Duration = Duration::from_millis(10);
/// Throttled requests tolerated inside one window before the throttle yields.
pub const REFRESH_ERROR_THRESHOLD: u32 = 100;

pub const DEFAULT_DATA_PORT: u16 = 11210;
pub const DEFAULT_DATA_SSL_PORT: u16 = 11207;
pub const DEFAULT_MGMT_PORT: u16 = 8091;
pub const DEFAULT_MGMT_SSL_PORT: u16 = 18091;
