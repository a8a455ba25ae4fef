//! The trunk request (`treq`): one in-flight application request.

use std::time::Instant;

use crate::connection::Tconn;
use crate::id::Id;
use crate::io::TrunkIo;

/// Handle to a [`Treq`].
pub type TreqId<Io> = Id<Treq<Io>>;

/// Why a request is being cancelled or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	/// No cancellation is in progress.
	None,
	/// Cancelled in response to an explicit `signal_cancel` call.
	Signal,
	/// Cancelled because the connection it was on is being torn down and the request is being
	/// moved to another connection (or the backlog). No cancel packet is sent for this reason.
	Move,
	/// A previously sent request is being requeued.
	Requeue,
}

/// Which container a treq currently lives in. Exactly one of these is true at any moment
/// (enforced by the dispatcher: moving a treq between containers is the only mutation path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
	/// Just allocated, or just detached from a connection with nowhere to go yet.
	Unassigned,
	/// Sitting in the trunk-wide backlog heap.
	Backlog,
	/// In a tconn's pending heap, not yet written.
	Pending,
	/// Partially written on one tconn (at most one such request per tconn).
	Partial,
	/// Fully written, awaiting a response.
	Sent,
	/// Completed or failed; returned to the free list but not yet released.
	Reapable,
	/// Marked for cancellation, awaiting the cancel-mux callback.
	Cancel,
	/// Cancel bytes partially written (at most one such request per tconn).
	CancelPartial,
	/// Cancel sent, awaiting a cancel-ack from the demuxer.
	CancelSent,
	/// Result delivered to the caller. Terminal.
	Complete,
	/// Terminal failure. Terminal.
	Failed,
}

impl ReqState {
	/// Whether this state is one of the two terminal states.
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Complete | Self::Failed)
	}
}

/// A trunk request. Generic over the embedding application's [`TrunkIo`] implementation, which
/// fixes the protocol payload type ("preq"), the result slot type ("rctx"), and the
/// application-level request handle type.
pub struct Treq<Io: TrunkIo> {
	id: TreqId<Io>,
	/// Monotonically increasing allocation order, used as the stable priority tie-break.
	pub(crate) sequence: u64,
	pub(crate) state: ReqState,
	/// The tconn this treq currently belongs to, if any. `None` while `Unassigned`/`Backlog`.
	pub(crate) tconn: Option<Id<Tconn<Io>>>,
	pub(crate) preq: Option<Io::Preq>,
	pub(crate) rctx: Option<Io::Rctx>,
	pub(crate) request: Option<Io::Request>,
	pub(crate) cancel_reason: CancelReason,
	/// When this treq entered `Reapable`, if it has. Drives `req_cleanup_delay` retention.
	pub(crate) reaped_at: Option<Instant>,
	/// Tags log lines emitted while this treq is being routed/mux'd/demux'd. Entered by the
	/// dispatcher around each per-treq signal, never held open across a callback boundary.
	pub(crate) span: tracing::Span,
}

impl<Io: TrunkIo> Treq<Io> {
	pub(crate) fn new(
		id: TreqId<Io>,
		sequence: u64,
		request: Io::Request,
		preq: Io::Preq,
		rctx: Io::Rctx,
	) -> Self {
		Self {
			id,
			sequence,
			state: ReqState::Unassigned,
			tconn: None,
			preq: Some(preq),
			rctx: Some(rctx),
			request: Some(request),
			cancel_reason: CancelReason::None,
			reaped_at: None,
			span: tracing::debug_span!("treq", id = ?id, seq = sequence),
		}
	}

	/// This treq's handle.
	pub fn id(&self) -> TreqId<Io> {
		self.id
	}

	/// This treq's log span. Clone and `.entered()` it around a per-treq signal; never hold the
	/// guard across a call into `Io`.
	pub fn span(&self) -> &tracing::Span {
		&self.span
	}

	/// Current dispatcher state.
	pub fn state(&self) -> ReqState {
		self.state
	}

	/// Borrow the protocol payload, if it hasn't already been taken for a callback.
	pub fn preq(&self) -> Option<&Io::Preq> {
		self.preq.as_ref()
	}

	/// Borrow the application-level request handle, if still attached.
	pub fn request(&self) -> Option<&Io::Request> {
		self.request.as_ref()
	}

	/// Why this treq is being cancelled, if it is.
	pub fn cancel_reason(&self) -> CancelReason {
		self.cancel_reason
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn terminal_states_are_recognised() {
		assert!(ReqState::Complete.is_terminal());
		assert!(ReqState::Failed.is_terminal());
		assert!(!ReqState::Sent.is_terminal());
		assert!(!ReqState::Cancel.is_terminal());
	}
}
