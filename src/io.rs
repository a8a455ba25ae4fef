//! The callback "vtable" an application implements to plug its protocol codec and connection
//! engine into a [`Trunk`](crate::trunk::Trunk), expressed as a trait rather than a struct of
//! function pointers: a `dyn`-free generic bound lets the application plug in its own protocol
//! codec and connection engine without any vtable indirection at the call sites that matter.

use std::cmp::Ordering;

use crate::connection::{Connection, IoEvents, Tconn, TconnId};
use crate::id::Arena;
use crate::request::{CancelReason, ReqState, Treq, TreqId};

/// Fixes the application-specific types a [`Trunk`](crate::trunk::Trunk) is generic over, and
/// supplies the callbacks that drive routing, serialization, and lifecycle decisions.
///
/// `preq`/`rctx`/`request` mirror the base collaborator's terminology: the protocol payload, the
/// result slot filled on completion, and the caller's own request handle.
pub trait TrunkIo: Sized {
	/// The lower-layer connection type this application's connection engine produces.
	type Connection: Connection;
	/// Opaque protocol payload carried by a treq until it is serialized.
	type Preq;
	/// Opaque result slot, filled by `request_complete`/`request_fail`.
	type Rctx;
	/// The caller's own handle for the originating request, detached on cancellation.
	type Request;

	/// Produce a fresh, `Halted` connection. Called by the management loop when growing the
	/// population.
	fn connection_alloc(&mut self) -> Option<Self::Connection>;

	/// Told which I/O events a tconn currently wants. Called at most once per dispatcher entry
	/// point per tconn, after all state mutations for that entry point have settled (§4.3).
	fn connection_notify(&mut self, tconn: TconnId<Self>, events: IoEvents);

	/// Order two `Active` tconns for routing purposes; "lesser" is preferred. The default orders
	/// by ascending load (fewest requests first), which is the common case described in §4.4.
	fn connection_prioritise(&self, a: &Tconn<Self>, b: &Tconn<Self>) -> Ordering {
		a.load().cmp(&b.load())
	}

	/// Order two treqs within a queue; "lesser" is popped first. The default preserves
	/// allocation order (FIFO).
	fn request_prioritise(&self, a: &Treq<Self>, b: &Treq<Self>) -> Ordering {
		a.sequence.cmp(&b.sequence)
	}

	/// Whether this application supports cancel-in-flight (`request_cancel_mux`/demux). If
	/// `false`, `signal_cancel` on an already-sent request just detaches and fails it instead of
	/// driving it through the cancel pipeline (§4.6).
	fn supports_cancel_mux(&self) -> bool {
		false
	}

	/// Write as many pending requests as the connection will currently accept. Implementations
	/// call [`MuxContext::pop_request`] and, for a partial write, [`MuxContext::signal_partial`];
	/// a fully written request must be reported via [`MuxContext::signal_sent`].
	fn request_mux(&mut self, tconn: TconnId<Self>, ctx: &mut MuxContext<'_, Self>);

	/// Parse as many responses as are available, reporting completions/failures via
	/// [`DemuxContext::signal_complete`]/[`DemuxContext::signal_fail`].
	fn request_demux(&mut self, tconn: TconnId<Self>, ctx: &mut DemuxContext<'_, Self>);

	/// Write as many queued cancellations as the connection will currently accept. Only called
	/// when [`TrunkIo::supports_cancel_mux`] returns `true`. Default no-op.
	fn request_cancel_mux(&mut self, _tconn: TconnId<Self>, _ctx: &mut CancelMuxContext<'_, Self>) {}

	/// A treq is being detached from a connection without being sent a cancel packet (reasons
	/// `Move`/`Requeue`), or is entering the cancel pipeline after an explicit `signal_cancel`
	/// (reason `Signal`). `request` is the caller's handle, taken from the treq.
	fn request_cancel(&mut self, treq: TreqId<Self>, request: Option<Self::Request>, reason: CancelReason);

	/// A treq reached `Complete`. `rctx` is the result slot that was being filled by demux.
	fn request_complete(&mut self, treq: TreqId<Self>, rctx: Self::Rctx);

	/// A treq reached `Failed`.
	fn request_fail(&mut self, treq: TreqId<Self>, rctx: Self::Rctx);

	/// Final teardown: invoked exactly once per treq, after `request_complete`/`request_fail`,
	/// handing back ownership of the payload for release.
	fn request_free(&mut self, treq: TreqId<Self>, preq: Self::Preq);
}

/// A callback the dispatcher must run against `&mut Io` after the current mux/demux/signal call
/// returns.
///
/// Exists because a direct call like `io.request_complete(...)` from inside a context object
/// that is itself borrowed from `&mut io` (as `MuxContext`/`DemuxContext` are) would require two
/// overlapping `&mut Io` borrows, which does not typecheck in safe Rust. Queuing the callback and
/// draining the queue once the triggering call returns preserves the relative ordering the
/// dispatcher promises (§4.6) without any re-entrant borrow.
pub(crate) enum PendingCallback<Io: TrunkIo> {
	Complete { treq: TreqId<Io>, rctx: Io::Rctx },
	Fail { treq: TreqId<Io>, rctx: Io::Rctx },
}

/// Detach `treq` from whichever container holds it in `tconn` and mark it terminal, recording a
/// `request_free` the caller must still schedule for the returned `preq` (if any).
fn detach_terminal<Io: TrunkIo>(
	treqs: &mut Arena<Treq<Io>>,
	tconn: &mut Tconn<Io>,
	treq_id: TreqId<Io>,
	terminal: ReqState,
) -> Option<Io::Rctx> {
	tconn.sent.shift_remove(&treq_id);
	if tconn.partial == Some(treq_id) {
		tconn.partial = None;
	}
	tconn.pending.remove_first(|id| *id == treq_id);
	let treq = treqs.get_mut(treq_id)?;
	treq.state = terminal;
	treq.tconn = None;
	treq.rctx.take()
}

/// Exposed to [`TrunkIo::request_mux`]: pop pending requests and report how much of each was
/// written.
pub struct MuxContext<'a, Io: TrunkIo> {
	pub(crate) treqs: &'a mut Arena<Treq<Io>>,
	pub(crate) tconn: &'a mut Tconn<Io>,
}

impl<'a, Io: TrunkIo> MuxContext<'a, Io> {
	/// Pop the highest-priority pending request, if any, moving it into `Pending`'s logical
	/// successor (the caller signals `Partial`/`Sent` once it knows how much was written).
	pub fn pop_request(&mut self) -> Option<TreqId<Io>> {
		self.tconn.pending.pop_min()
	}

	/// Borrow the protocol payload for `treq`, if it is still attached.
	pub fn preq(&self, treq: TreqId<Io>) -> Option<&Io::Preq> {
		self.treqs.get(treq)?.preq.as_ref()
	}

	/// Report that `treq` was partially written and must be continued on the next writable
	/// event. At most one request may be `Partial` per tconn at a time (§3 invariant).
	pub fn signal_partial(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		if let Some(t) = self.treqs.get_mut(treq) {
			debug_assert_eq!(t.state, ReqState::Pending, "signal_partial on a treq not popped from pending");
			t.state = ReqState::Partial;
		}
		self.tconn.partial = Some(treq);
		self.tconn.notify_dirty = true;
	}

	/// Report that `treq` was fully written.
	pub fn signal_sent(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		if self.tconn.partial == Some(treq) {
			self.tconn.partial = None;
		}
		if let Some(t) = self.treqs.get_mut(treq) {
			debug_assert!(
				matches!(t.state, ReqState::Pending | ReqState::Partial),
				"signal_sent from a state other than Pending/Partial",
			);
			t.state = ReqState::Sent;
		}
		self.tconn.sent.insert(treq);
		self.tconn.notify_dirty = true;
	}
}

/// Exposed to [`TrunkIo::request_demux`]: report completions and failures as responses are
/// parsed off the wire.
pub struct DemuxContext<'a, Io: TrunkIo> {
	pub(crate) treqs: &'a mut Arena<Treq<Io>>,
	pub(crate) tconn: &'a mut Tconn<Io>,
	pub(crate) callbacks: &'a mut Vec<PendingCallback<Io>>,
}

impl<'a, Io: TrunkIo> DemuxContext<'a, Io> {
	/// Mutably borrow the result slot for `treq`, to be filled in before signalling completion.
	pub fn rctx_mut(&mut self, treq: TreqId<Io>) -> Option<&mut Io::Rctx> {
		self.treqs.get_mut(treq)?.rctx.as_mut()
	}

	/// `treq` received a full, successful response. Precondition: `treq` was `Sent` (§4.6).
	pub fn signal_complete(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		debug_assert!(
			matches!(self.treqs.get(treq).map(|t| t.state), Some(ReqState::Sent)),
			"signal_complete on a treq that wasn't Sent",
		);
		if let Some(rctx) = detach_terminal(self.treqs, self.tconn, treq, ReqState::Complete) {
			self.callbacks.push(PendingCallback::Complete { treq, rctx });
		}
		self.tconn.notify_dirty = true;
	}

	/// `treq` received a response indicating terminal failure.
	pub fn signal_fail(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		debug_assert!(
			self.treqs.get(treq).map_or(true, |t| !t.state.is_terminal()),
			"signal_fail on a treq already in a terminal state",
		);
		if let Some(rctx) = detach_terminal(self.treqs, self.tconn, treq, ReqState::Failed) {
			self.callbacks.push(PendingCallback::Fail { treq, rctx });
		}
		self.tconn.notify_dirty = true;
	}

	/// A cancel-ack arrived for `treq`, which was in `CancelSent` or `Cancel` (never got as far
	/// as writing the cancellation). Finalizes it as failed-cancelled.
	pub fn signal_cancel_complete(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		debug_assert!(
			matches!(self.treqs.get(treq).map(|t| t.state), Some(ReqState::Cancel | ReqState::CancelPartial | ReqState::CancelSent)),
			"signal_cancel_complete on a treq not in the cancel pipeline",
		);
		self.tconn.cancel_sent.shift_remove(&treq);
		if self.tconn.cancel_partial == Some(treq) {
			self.tconn.cancel_partial = None;
		}
		self.tconn.cancel.remove_first(|id| *id == treq);
		if let Some(t) = self.treqs.get_mut(treq) {
			t.state = ReqState::Failed;
			t.tconn = None;
			if let Some(rctx) = t.rctx.take() {
				self.callbacks.push(PendingCallback::Fail { treq, rctx });
			}
		}
		self.tconn.notify_dirty = true;
	}
}

/// Exposed to [`TrunkIo::request_cancel_mux`]: write cancellation packets for requests already
/// in the cancel pipeline.
pub struct CancelMuxContext<'a, Io: TrunkIo> {
	pub(crate) treqs: &'a mut Arena<Treq<Io>>,
	pub(crate) tconn: &'a mut Tconn<Io>,
}

impl<'a, Io: TrunkIo> CancelMuxContext<'a, Io> {
	/// Pop the next queued cancellation, if any.
	pub fn pop_cancellation(&mut self) -> Option<TreqId<Io>> {
		self.tconn.cancel.pop_min()
	}

	/// Borrow the protocol payload for `treq`, to build the cancellation packet from.
	pub fn preq(&self, treq: TreqId<Io>) -> Option<&Io::Preq> {
		self.treqs.get(treq)?.preq.as_ref()
	}

	/// Report that the cancellation for `treq` was partially written.
	pub fn signal_cancel_partial(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		if let Some(t) = self.treqs.get_mut(treq) {
			debug_assert_eq!(t.state, ReqState::Cancel, "signal_cancel_partial on a treq not popped from cancel");
			t.state = ReqState::CancelPartial;
		}
		self.tconn.cancel_partial = Some(treq);
		self.tconn.notify_dirty = true;
	}

	/// Report that the cancellation for `treq` was fully written.
	pub fn signal_cancel_sent(&mut self, treq: TreqId<Io>) {
		let span = self.treqs.get(treq).map(|t| t.span.clone());
		let _enter = span.as_ref().map(|s| s.enter());
		if self.tconn.cancel_partial == Some(treq) {
			self.tconn.cancel_partial = None;
		}
		if let Some(t) = self.treqs.get_mut(treq) {
			debug_assert!(
				matches!(t.state, ReqState::Cancel | ReqState::CancelPartial),
				"signal_cancel_sent from a state other than Cancel/CancelPartial",
			);
			t.state = ReqState::CancelSent;
		}
		self.tconn.cancel_sent.insert(treq);
		self.tconn.notify_dirty = true;
	}
}
