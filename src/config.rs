//! Trunk configuration: connection population knobs, load thresholds, and timing hysteresis.
//!
//! Loading these values out of a configuration file or environment is explicitly out of scope
//! (see the crate's module documentation); this module only owns the struct, its defaults, and
//! validation of the invariants that are checkable without reference to live trunk state.

use std::fmt;
use std::time::Duration;

/// Configuration for a [`Trunk`](crate::trunk::Trunk), supplied once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunkConfig {
	/// How many connections to start with.
	pub start: u16,
	/// The trunk should not let the active+connecting population drop below this.
	pub min: u16,
	/// Maximum number of connections the trunk may hold at once.
	pub max: u16,
	/// Maximum number of connections that may be in the `Connecting` state at once.
	pub connecting: u16,

	/// How many pending requests should ideally be running on each active connection,
	/// averaged across the active set.
	pub target_req_per_conn: u32,
	/// Maximum requests (pending+partial+sent) a single connection may carry. `0` = no cap.
	pub max_req_per_conn: u32,

	/// Maximum number of requests a connection may carry over its lifetime. `0` = unlimited.
	pub max_uses: u64,
	/// Maximum wall-clock age of a connection before it is drained and replaced.
	pub lifetime: Option<Duration>,

	/// How long utilisation must stay above target before a new connection is opened.
	pub open_delay: Duration,
	/// How long utilisation must stay below target before an active connection is closed.
	pub close_delay: Duration,

	/// How long a completed request may sit on the free list before being released.
	pub req_cleanup_delay: Duration,
	/// How often the management loop runs.
	pub manage_interval: Duration,

	/// Arena-sizing hint: expected distinct allocations per treq payload.
	pub req_pool_headers: usize,
	/// Arena-sizing hint: expected byte size of a treq payload.
	pub req_pool_size: usize,

	/// If true, the embedding connection type can always accept more bytes regardless of
	/// socket-level writability; `signal_writable` is never called and enqueue invokes the
	/// mux callback immediately.
	pub always_writable: bool,

	/// Whether the backlog may keep admitting requests once the trunk cannot grow further
	/// and every existing connection is saturated (see the open-question resolution in
	/// `DESIGN.md`). When `false`, that situation returns `NoCapacity` instead.
	pub backlog_on_exhaustion: bool,
}

impl Default for TrunkConfig {
	fn default() -> Self {
		Self {
			start: 1,
			min: 1,
			max: 4,
			connecting: 1,
			target_req_per_conn: 0,
			max_req_per_conn: 0,
			max_uses: 0,
			lifetime: None,
			open_delay: Duration::from_millis(100),
			close_delay: Duration::from_secs(10),
			req_cleanup_delay: Duration::from_secs(5),
			manage_interval: Duration::from_millis(100),
			req_pool_headers: 0,
			req_pool_size: 0,
			always_writable: false,
			backlog_on_exhaustion: true,
		}
	}
}

/// A `TrunkConfig` violates an invariant `Trunk::new` requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	/// `min` is greater than `max`.
	MinExceedsMax { min: u16, max: u16 },
	/// `start` is greater than `max`.
	StartExceedsMax { start: u16, max: u16 },
	/// `connecting` is zero while the trunk is allowed to hold connections (`max > 0`).
	ZeroConnectingCap,
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::MinExceedsMax { min, max } => write!(f, "min ({min}) exceeds max ({max})"),
			Self::StartExceedsMax { start, max } => write!(f, "start ({start}) exceeds max ({max})"),
			Self::ZeroConnectingCap => write!(f, "connecting must be at least 1 when max > 0"),
		}
	}
}

impl std::error::Error for ConfigError {}

impl TrunkConfig {
	/// Check the invariants in the data model that are expressible statically, independent of
	/// any live trunk state.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.min > self.max {
			return Err(ConfigError::MinExceedsMax { min: self.min, max: self.max });
		}
		if self.start > self.max {
			return Err(ConfigError::StartExceedsMax { start: self.start, max: self.max });
		}
		if self.max > 0 && self.connecting == 0 {
			return Err(ConfigError::ZeroConnectingCap);
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn default_config_is_valid() {
		assert_eq!(TrunkConfig::default().validate(), Ok(()));
	}

	#[test]
	fn min_exceeding_max_is_rejected() {
		let conf = TrunkConfig { min: 5, max: 2, ..TrunkConfig::default() };
		assert_eq!(conf.validate(), Err(ConfigError::MinExceedsMax { min: 5, max: 2 }));
	}

	#[test]
	fn start_exceeding_max_is_rejected() {
		let conf = TrunkConfig { start: 5, max: 2, min: 0, ..TrunkConfig::default() };
		assert_eq!(conf.validate(), Err(ConfigError::StartExceedsMax { start: 5, max: 2 }));
	}

	#[test]
	fn zero_connecting_cap_rejected_unless_max_zero() {
		let conf = TrunkConfig { connecting: 0, max: 3, min: 0, start: 0, ..TrunkConfig::default() };
		assert_eq!(conf.validate(), Err(ConfigError::ZeroConnectingCap));

		let conf = TrunkConfig { connecting: 0, max: 0, min: 0, start: 0, ..TrunkConfig::default() };
		assert_eq!(conf.validate(), Ok(()));
	}
}
