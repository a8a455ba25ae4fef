//! The trunk connection (`tconn`): the trunk's wrapper around one physical [`Connection`], and
//! its six request queues.

use std::time::Instant;

use indexmap::IndexSet;

use crate::id::Id;
use crate::io::TrunkIo;
use crate::priority::PriorityQueue;
use crate::request::TreqId;

/// The lower layer this crate consumes but does not implement: the state machine of one
/// physical connection (halted → connecting → connected → failed → closed), its reconnection
/// backoff, and its timers. See the crate documentation for the division of responsibility.
pub trait Connection {
	/// Ask the connection to begin connecting. Called once, immediately after
	/// `connection_alloc` returns a fresh (`Halted`) connection.
	fn start(&mut self);

	/// Ask the connection to reconnect (it is suspected unusable). Moves it back towards
	/// `Halted`/`Connecting` from the connection engine's point of view.
	fn reconnect(&mut self);

	/// Ask the connection to close. No further events will be polled from it.
	fn close(&mut self);

	/// Poll for a state-transition event reported by the connection engine's watch callbacks.
	/// Returns `None` if nothing has changed since the last poll.
	fn poll_event(&mut self) -> Option<ConnectionEvent>;
}

/// An event reported by the underlying [`Connection`], driving its tconn's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
	/// The connection finished connecting and is ready to service requests.
	Connected,
	/// The connection failed (from any non-closed state).
	Failed,
	/// The connection finished closing and may be freed.
	Closed,
}

/// Which I/O events a tconn currently wants to be notified of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoEvents {
	pub read: bool,
	pub write: bool,
}

/// Used for sanity checks and to track which pool a tconn belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
	/// The initial state: allocated, not yet asked to start.
	Halted,
	/// Asked to start; waiting for the connection engine to report `Connected` or `Failed`.
	Connecting,
	/// Connected and eligible to receive new requests.
	Active,
	/// Connected, but administratively or automatically ineligible for new requests. Existing
	/// requests continue to be serviced.
	Inactive,
	/// Accepts no new requests; closes once its in-flight set is empty.
	Draining,
	/// Like `Draining`, but the tconn is also freed (not reused) once empty.
	DrainingToFree,
	/// The connection engine reported failure. Awaiting the `Closed` event.
	Failed,
	/// Fully closed. About to be removed from the trunk.
	Closed,
}

impl ConnState {
	/// Bitmask value matching `fr_trunk_connection_state_t` in the original C implementation,
	/// kept as a cheap way to build multi-state set queries (`ConnStateMask`).
	fn bit(self) -> u8 {
		match self {
			Self::Halted => 0x00,
			Self::Connecting => 0x01,
			Self::Active => 0x02,
			Self::Failed => 0x04,
			Self::Closed => 0x08,
			Self::Inactive => 0x10,
			Self::Draining => 0x20,
			Self::DrainingToFree => 0x40,
		}
	}

	/// Whether new requests may be routed onto a tconn in this state.
	pub fn accepts_new_requests(self) -> bool {
		matches!(self, Self::Active)
	}

	/// Whether a response could still arrive for requests already on a tconn in this state.
	pub fn may_have_reads(self) -> bool {
		matches!(self, Self::Active | Self::Inactive | Self::Draining | Self::DrainingToFree)
	}

	/// Whether the tconn counts towards `conf.max`/`conf.connecting`.
	pub fn is_non_closed(self) -> bool {
		!matches!(self, Self::Closed)
	}
}

/// A bitmask over [`ConnState`], for "connections in any of these states" queries, mirroring
/// `FR_TRUNK_CONN_ALL` and friends in the original header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnStateMask(u8);

impl ConnStateMask {
	/// An empty mask.
	pub const NONE: Self = Self(0);

	/// `Active | Connecting | Inactive`: states from which a request could still be routed or
	/// eventually routed.
	pub fn routable() -> Self {
		Self::from(ConnState::Active) | Self::from(ConnState::Connecting) | Self::from(ConnState::Inactive)
	}

	/// Whether `state` is one of the states in this mask.
	pub fn contains(self, state: ConnState) -> bool {
		self.0 & state.bit() == state.bit()
	}

	/// Whether this mask has no states set.
	pub fn is_empty(self) -> bool {
		self.0 == 0
	}
}

impl From<ConnState> for ConnStateMask {
	fn from(state: ConnState) -> Self {
		Self(state.bit())
	}
}

impl std::ops::BitOr for ConnStateMask {
	type Output = Self;
	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

/// Handle to a [`Tconn`].
pub type TconnId<Io> = Id<Tconn<Io>>;

/// The trunk's wrapper around one physical [`Connection`]: its lifecycle state and its six
/// request queues (pending, partial, sent, cancel, cancel_partial, cancel_sent).
pub struct Tconn<Io: TrunkIo> {
	id: TconnId<Io>,
	pub(crate) connection: Io::Connection,
	pub(crate) state: ConnState,
	/// Set once the user has explicitly signalled `Inactive`; disables automatic reactivation
	/// on queue drain until the user signals `Active` again (the "sticky" rule in §4.3).
	pub(crate) user_inactive: bool,
	pub(crate) pending: PriorityQueue<TreqId<Io>>,
	pub(crate) partial: Option<TreqId<Io>>,
	pub(crate) sent: IndexSet<TreqId<Io>>,
	pub(crate) cancel: PriorityQueue<TreqId<Io>>,
	pub(crate) cancel_partial: Option<TreqId<Io>>,
	pub(crate) cancel_sent: IndexSet<TreqId<Io>>,
	pub(crate) opened_at: Instant,
	pub(crate) connected_at: Option<Instant>,
	pub(crate) use_count: u64,
	/// Set whenever a mutation may have changed this tconn's computed `IoEvents`; drained (and
	/// `connection_notify` invoked) once at the end of the dispatcher entry point that set it.
	pub(crate) notify_dirty: bool,
}

impl<Io: TrunkIo> Tconn<Io> {
	pub(crate) fn new(id: TconnId<Io>, connection: Io::Connection, now: Instant) -> Self {
		Self {
			id,
			connection,
			state: ConnState::Halted,
			user_inactive: false,
			pending: PriorityQueue::new(),
			partial: None,
			sent: IndexSet::new(),
			cancel: PriorityQueue::new(),
			cancel_partial: None,
			cancel_sent: IndexSet::new(),
			opened_at: now,
			connected_at: None,
			use_count: 0,
			notify_dirty: false,
		}
	}

	/// This tconn's handle.
	pub fn id(&self) -> TconnId<Io> {
		self.id
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ConnState {
		self.state
	}

	/// Borrow the underlying connection.
	pub fn connection(&self) -> &Io::Connection {
		&self.connection
	}

	/// Mutably borrow the underlying connection.
	pub fn connection_mut(&mut self) -> &mut Io::Connection {
		&mut self.connection
	}

	/// Number of requests currently in flight on this tconn (pending + partial + sent).
	pub fn load(&self) -> usize {
		self.pending.len() + self.partial.is_some() as usize + self.sent.len()
	}

	/// Whether this tconn currently has no in-flight or in-flight-cancel work at all.
	pub(crate) fn is_idle(&self) -> bool {
		self.load() == 0 && self.cancel.is_empty() && self.cancel_partial.is_none() && self.cancel_sent.is_empty()
	}

	/// Compute the I/O interest this tconn currently wants, per §4.3.
	pub(crate) fn io_events(&self, always_writable: bool) -> IoEvents {
		let read = self.state.may_have_reads();
		let write = !always_writable
			&& (!self.pending.is_empty() || self.partial.is_some()
				|| !self.cancel.is_empty() || self.cancel_partial.is_some());
		IoEvents { read, write }
	}
}
