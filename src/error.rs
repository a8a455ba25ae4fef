//! Error and outcome types, hand-written rather than via a derive-macro error crate: a trunk's
//! error surface is small enough that manual `Display`/`Error` impls stay readable.

use std::error::Error;
use std::fmt;

/// Outcome of [`Trunk::enqueue`](crate::trunk::Trunk::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
	/// The request was attached directly to a connection's pending queue.
	Ok,
	/// The request was placed in the trunk-wide backlog, awaiting a viable connection.
	InBacklog,
	/// The trunk is at maximum capacity and every connection is saturated.
	NoCapacity,
	/// There are no connections and none may be created (destination administratively down).
	DstUnavailable,
	/// The enqueue could not proceed (e.g. the trunk is stopping).
	Fail,
}

impl fmt::Display for EnqueueOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ok => write!(f, "enqueued"),
			Self::InBacklog => write!(f, "placed in backlog"),
			Self::NoCapacity => write!(f, "no capacity"),
			Self::DstUnavailable => write!(f, "destination unavailable"),
			Self::Fail => write!(f, "enqueue failed"),
		}
	}
}

/// A programming-error-class failure in the trunk's public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkError {
	/// The referenced treq no longer exists (already freed, or from a different trunk).
	UnknownRequest,
	/// The referenced tconn no longer exists (already freed, or from a different trunk).
	UnknownConnection,
	/// The signal is not valid for the treq's current state (a no-op per the dispatcher table,
	/// surfaced here only to callers that want to assert against misuse).
	InvalidState,
	/// The trunk is stopping and rejects new work.
	Stopping,
	/// `connection_alloc` failed to produce a new connection.
	ConnectionAllocFailed,
}

impl fmt::Display for TrunkError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::UnknownRequest => write!(f, "no such trunk request"),
			Self::UnknownConnection => write!(f, "no such trunk connection"),
			Self::InvalidState => write!(f, "operation not valid for the current state"),
			Self::Stopping => write!(f, "trunk is stopping"),
			Self::ConnectionAllocFailed => write!(f, "connection_alloc failed to produce a connection"),
		}
	}
}

impl Error for TrunkError {}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn outcomes_display_distinct_messages() {
		let rendered: Vec<String> = [
			EnqueueOutcome::Ok,
			EnqueueOutcome::InBacklog,
			EnqueueOutcome::NoCapacity,
			EnqueueOutcome::DstUnavailable,
			EnqueueOutcome::Fail,
		].iter().map(|o| o.to_string()).collect();

		let unique: std::collections::HashSet<&String> = rendered.iter().collect();
		assert_eq!(unique.len(), rendered.len());
	}
}
