//! The trunk itself: owns the connection and request populations, the backlog, and the
//! dispatcher that drives every state transition described in the other modules.

use std::cmp::Ordering;
use std::time::Instant;

use crate::clock::Clock;
use crate::config::TrunkConfig;
use crate::connection::{Connection, ConnState, ConnStateMask, ConnectionEvent, Tconn, TconnId};
use crate::error::{EnqueueOutcome, TrunkError};
use crate::id::Arena;
use crate::io::{CancelMuxContext, DemuxContext, MuxContext, PendingCallback, TrunkIo};
use crate::request::{CancelReason, ReqState, Treq, TreqId};
use crate::priority::PriorityQueue;

/// Compare two treqs by the application's priority order. A free function (rather than a
/// `Trunk` method) so it can be handed to `PriorityQueue::insert` alongside a disjoint mutable
/// borrow of the queue itself, which a closure capturing `&self` whole could not coexist with.
fn compare_treqs<Io: TrunkIo>(io: &Io, treqs: &Arena<Treq<Io>>, a: &TreqId<Io>, b: &TreqId<Io>) -> Ordering {
	match (treqs.get(*a), treqs.get(*b)) {
		(Some(ta), Some(tb)) => io.request_prioritise(ta, tb),
		(Some(_), None) => Ordering::Less,
		(None, Some(_)) => Ordering::Greater,
		(None, None) => Ordering::Equal,
	}
}

/// A managed bundle of homogeneous outbound connections, multiplexing application requests
/// across them.
///
/// `Trunk` is not internally locked: every public entry point (`enqueue`, the `signal_*`
/// family, `manage_tick`, `poll_connections`) must be called from the same thread, and none of
/// them suspend internally — they run to completion, matching the single-threaded cooperative
/// event loop this crate assumes (see the crate documentation).
pub struct Trunk<Io: TrunkIo> {
	name: String,
	conf: TrunkConfig,
	io: Io,
	clock: Box<dyn Clock>,
	treqs: Arena<Treq<Io>>,
	tconns: Arena<Tconn<Io>>,
	backlog: PriorityQueue<TreqId<Io>>,
	sequence: u64,
	pending_callbacks: Vec<PendingCallback<Io>>,
	stopping: bool,
	above_target_since: Option<Instant>,
	below_target_since: Option<Instant>,
}

impl<Io: TrunkIo> Trunk<Io> {
	/// Construct a trunk and spawn its `conf.start` initial connections.
	///
	/// Fails if `conf` violates its own static invariants (see [`TrunkConfig::validate`]); does
	/// not fail if individual `connection_alloc` calls fail during startup (those connections
	/// are simply absent and the management loop will keep retrying via the `min` enforcement).
	pub fn new(name: impl Into<String>, conf: TrunkConfig, io: Io, clock: Box<dyn Clock>) -> Result<Self, crate::config::ConfigError> {
		conf.validate()?;
		let mut trunk = Self {
			name: name.into(),
			conf,
			io,
			clock,
			treqs: Arena::new(),
			tconns: Arena::new(),
			backlog: PriorityQueue::new(),
			sequence: 0,
			pending_callbacks: Vec::new(),
			stopping: false,
			above_target_since: None,
			below_target_since: None,
		};
		for _ in 0..trunk.conf.start {
			let _ = trunk.spawn_connection();
		}
		Ok(trunk)
	}

	/// The trunk's name, used to tag log lines.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Borrow the trunk's configuration.
	pub fn config(&self) -> &TrunkConfig {
		&self.conf
	}

	/// Borrow the `TrunkIo` implementation this trunk was constructed with.
	pub fn io(&self) -> &Io {
		&self.io
	}

	/// Mutably borrow the `TrunkIo` implementation. Mainly useful for test harnesses that need
	/// to pre-seed state (e.g. queueing a canned response) the trunk has no reason to expose
	/// through its own API.
	pub fn io_mut(&mut self) -> &mut Io {
		&mut self.io
	}

	/// Every tconn currently known to the trunk, in arena order.
	pub fn tconn_ids(&self) -> Vec<TconnId<Io>> {
		self.tconns.iter().map(|(id, _)| id).collect()
	}

	/// Every treq currently known to the trunk, in arena order.
	pub fn treq_ids(&self) -> Vec<TreqId<Io>> {
		self.treqs.iter().map(|(id, _)| id).collect()
	}

	/// Borrow a treq by id, for inspection.
	pub fn treq(&self, treq_id: TreqId<Io>) -> Option<&Treq<Io>> {
		self.treqs.get(treq_id)
	}

	/// Borrow a tconn by id, for inspection.
	pub fn tconn(&self, tconn_id: TconnId<Io>) -> Option<&Tconn<Io>> {
		self.tconns.get(tconn_id)
	}

	/// Begin stopping the trunk: further `enqueue` calls return `Fail`. Already in-flight
	/// requests are left to complete; the caller is responsible for draining connections.
	pub fn stop(&mut self) {
		self.stopping = true;
		tracing::debug!(trunk = %self.name, "trunk stopping");
	}

	fn next_sequence(&mut self) -> u64 {
		let sequence = self.sequence;
		self.sequence += 1;
		sequence
	}

	fn non_closed_count(&self) -> usize {
		self.tconns.iter().filter(|(_, t)| t.state.is_non_closed()).count()
	}

	/// Iterate over every live tconn's id and state, for statistics queries.
	pub(crate) fn tconns_iter(&self) -> impl Iterator<Item = (TconnId<Io>, ConnState)> + '_ {
		self.tconns.iter().map(|(id, t)| (id, t.state))
	}

	/// Iterate over every live treq's id, state, and owning tconn, for statistics queries.
	pub(crate) fn treqs_iter(&self) -> impl Iterator<Item = (TreqId<Io>, ReqState, Option<TconnId<Io>>)> + '_ {
		self.treqs.iter().map(|(id, t)| (id, t.state, t.tconn))
	}

	// -- enqueue / routing ------------------------------------------------------------------

	/// Enqueue a new application request, returning the outcome of the routing attempt.
	pub fn enqueue(&mut self, request: Io::Request, preq: Io::Preq, rctx: Io::Rctx) -> EnqueueOutcome {
		let _span = tracing::trace_span!("enqueue", trunk = %self.name).entered();
		if self.stopping {
			return EnqueueOutcome::Fail;
		}
		let sequence = self.next_sequence();
		let treq_id = self.treqs.insert_with(|id| Treq::new(id, sequence, request, preq, rctx));
		let outcome = self.route(treq_id);
		if matches!(outcome, EnqueueOutcome::NoCapacity | EnqueueOutcome::DstUnavailable | EnqueueOutcome::Fail) {
			self.fail_treq(treq_id);
		}
		tracing::trace!(trunk = %self.name, treq = ?treq_id, ?outcome, "enqueue outcome");
		self.drain_notify();
		outcome
	}

	/// The routing algorithm of §4.4: try to attach directly to a connection, else backlog,
	/// else reject.
	fn route(&mut self, treq_id: TreqId<Io>) -> EnqueueOutcome {
		if self.stopping {
			return EnqueueOutcome::Fail;
		}
		let routable_exists = self.tconns.iter().any(|(_, t)| ConnStateMask::routable().contains(t.state));
		if !routable_exists && self.conf.max == 0 {
			return EnqueueOutcome::DstUnavailable;
		}
		if let Some(tconn_id) = self.find_routable_tconn() {
			self.assign_to_tconn(treq_id, tconn_id);
			return EnqueueOutcome::Ok;
		}
		let any_connecting = self.tconns.iter().any(|(_, t)| t.state == ConnState::Connecting);
		let can_grow = self.non_closed_count() < self.conf.max as usize;
		if self.conf.backlog_on_exhaustion || can_grow || any_connecting {
			if let Some(treq) = self.treqs.get_mut(treq_id) {
				treq.state = ReqState::Backlog;
			}
			let sequence = self.treqs.get(treq_id).map(|t| t.sequence).unwrap_or(0);
			let Self { backlog, treqs, io, .. } = self;
			backlog.insert(treq_id, sequence, |a, b| compare_treqs(io, treqs, a, b));
			EnqueueOutcome::InBacklog
		} else {
			EnqueueOutcome::NoCapacity
		}
	}

	/// The `Active` tconn with the fewest requests in flight among those still under
	/// `max_req_per_conn`, per `connection_prioritise`.
	fn find_routable_tconn(&self) -> Option<TconnId<Io>> {
		let mut best: Option<TconnId<Io>> = None;
		for (id, tconn) in self.tconns.iter() {
			if tconn.state != ConnState::Active {
				continue;
			}
			if self.conf.max_req_per_conn != 0 && tconn.load() as u32 >= self.conf.max_req_per_conn {
				continue;
			}
			best = match best {
				None => Some(id),
				Some(best_id) => {
					let best_tconn = self.tconns.get(best_id).expect("best tconn id is always live");
					if self.io.connection_prioritise(tconn, best_tconn) == Ordering::Less {
						Some(id)
					} else {
						Some(best_id)
					}
				},
			};
		}
		best
	}

	/// Attach `treq_id` to `tconn_id`'s pending queue.
	fn assign_to_tconn(&mut self, treq_id: TreqId<Io>, tconn_id: TconnId<Io>) {
		let sequence = match self.treqs.get_mut(treq_id) {
			Some(treq) => {
				treq.state = ReqState::Pending;
				treq.tconn = Some(tconn_id);
				treq.sequence
			},
			None => return,
		};
		let Self { tconns, treqs, io, .. } = self;
		if let Some(tconn) = tconns.get_mut(tconn_id) {
			tconn.pending.insert(treq_id, sequence, |a, b| compare_treqs(io, treqs, a, b));
			tconn.notify_dirty = true;
		}
	}

	/// Move backlog entries onto `tconn_id`, highest-priority first, while it has room and is
	/// still under `target_req_per_conn` (§4.4 "draining backlog").
	fn drain_backlog_onto(&mut self, tconn_id: TconnId<Io>) {
		loop {
			let eligible = match self.tconns.get(tconn_id) {
				Some(t) if t.state == ConnState::Active => {
					let under_cap = self.conf.max_req_per_conn == 0 || (t.load() as u32) < self.conf.max_req_per_conn;
					let under_target = self.conf.target_req_per_conn == 0 || (t.load() as u32) < self.conf.target_req_per_conn;
					under_cap && under_target
				},
				_ => false,
			};
			if !eligible || self.backlog.is_empty() {
				break;
			}
			match self.backlog.pop_min() {
				Some(treq_id) => self.assign_to_tconn(treq_id, tconn_id),
				None => break,
			}
		}
	}

	// -- request signal dispatcher ------------------------------------------------------------

	/// Terminate `treq_id` as failed, invoking `request_fail` (if it still has a result slot)
	/// and moving it onto the free list (see [`Trunk::reap`]).
	fn fail_treq(&mut self, treq_id: TreqId<Io>) {
		let rctx = match self.treqs.get_mut(treq_id) {
			Some(treq) => {
				let _enter = treq.span().clone().entered();
				treq.state = ReqState::Failed;
				tracing::trace!("failing request");
				treq.rctx.take()
			},
			None => return,
		};
		if let Some(rctx) = rctx {
			self.io.request_fail(treq_id, rctx);
		}
		self.reap(treq_id);
	}

	/// A connection became writable: run the cancel-mux pass (if there is cancel work queued
	/// and the application supports it) followed by the ordinary mux pass.
	pub fn signal_writable(&mut self, tconn_id: TconnId<Io>) {
		let _span = tracing::trace_span!("signal_writable", trunk = %self.name, tconn = ?tconn_id).entered();
		if self.io.supports_cancel_mux() {
			let has_cancel_work = self.tconns.get(tconn_id)
				.map(|t| !t.cancel.is_empty() || t.cancel_partial.is_some())
				.unwrap_or(false);
			if has_cancel_work {
				self.dispatch_cancel_mux(tconn_id);
			}
		}
		self.dispatch_mux(tconn_id);
		self.drain_callbacks();
		self.drain_notify();
	}

	/// A connection became readable: run the demux pass.
	pub fn signal_readable(&mut self, tconn_id: TconnId<Io>) {
		let _span = tracing::trace_span!("signal_readable", trunk = %self.name, tconn = ?tconn_id).entered();
		self.dispatch_demux(tconn_id);
		self.drain_callbacks();
		self.drain_notify();
	}

	fn dispatch_mux(&mut self, tconn_id: TconnId<Io>) {
		let Self { treqs, tconns, io, .. } = self;
		if let Some(tconn) = tconns.get_mut(tconn_id) {
			let mut ctx = MuxContext { treqs, tconn };
			io.request_mux(tconn_id, &mut ctx);
		}
		self.check_auto_inactive(tconn_id);
	}

	fn dispatch_demux(&mut self, tconn_id: TconnId<Io>) {
		let Self { treqs, tconns, io, pending_callbacks, .. } = self;
		if let Some(tconn) = tconns.get_mut(tconn_id) {
			let mut ctx = DemuxContext { treqs, tconn, callbacks: pending_callbacks };
			io.request_demux(tconn_id, &mut ctx);
		}
		self.check_auto_active(tconn_id);
	}

	fn dispatch_cancel_mux(&mut self, tconn_id: TconnId<Io>) {
		let Self { treqs, tconns, io, .. } = self;
		if let Some(tconn) = tconns.get_mut(tconn_id) {
			let mut ctx = CancelMuxContext { treqs, tconn };
			io.request_cancel_mux(tconn_id, &mut ctx);
		}
	}

	/// Auto-transition `Active -> Inactive` once a tconn reaches `max_req_per_conn` (§4.3).
	fn check_auto_inactive(&mut self, tconn_id: TconnId<Io>) {
		if self.conf.max_req_per_conn == 0 {
			return;
		}
		if let Some(tconn) = self.tconns.get_mut(tconn_id) {
			if tconn.state == ConnState::Active && tconn.load() as u32 >= self.conf.max_req_per_conn {
				tconn.state = ConnState::Inactive;
				tconn.notify_dirty = true;
			}
		}
	}

	/// Auto-transition back `Inactive -> Active` once load drops below `max_req_per_conn`,
	/// unless the user explicitly signalled `Inactive` (sticky, §4.3).
	fn check_auto_active(&mut self, tconn_id: TconnId<Io>) {
		let became_active = match self.tconns.get_mut(tconn_id) {
			Some(tconn) if tconn.state == ConnState::Inactive && !tconn.user_inactive => {
				let under_cap = self.conf.max_req_per_conn == 0 || (tconn.load() as u32) < self.conf.max_req_per_conn;
				if under_cap {
					tconn.state = ConnState::Active;
					tconn.notify_dirty = true;
					true
				} else {
					false
				}
			},
			_ => false,
		};
		if became_active {
			self.drain_backlog_onto(tconn_id);
		}
	}

	/// Administratively mark a tconn ineligible for new routing. Existing requests continue.
	/// Sticky: disables automatic reactivation until [`Trunk::signal_active`] is called.
	pub fn signal_inactive(&mut self, tconn_id: TconnId<Io>) {
		if let Some(tconn) = self.tconns.get_mut(tconn_id) {
			tconn.user_inactive = true;
			if tconn.state == ConnState::Active {
				tconn.state = ConnState::Inactive;
				tconn.notify_dirty = true;
			}
		}
		self.drain_notify();
	}

	/// Restore a tconn's eligibility for new routing, and attempt to drain the backlog onto it.
	pub fn signal_active(&mut self, tconn_id: TconnId<Io>) {
		if let Some(tconn) = self.tconns.get_mut(tconn_id) {
			tconn.user_inactive = false;
			if tconn.state == ConnState::Inactive {
				tconn.state = ConnState::Active;
				tconn.notify_dirty = true;
			}
		}
		self.drain_backlog_onto(tconn_id);
		self.drain_notify();
	}

	/// Move a tconn to `Draining`, request the underlying connection reconnect, and requeue its
	/// in-flight work (reason `Move`, no cancel packet sent).
	pub fn signal_reconnect(&mut self, tconn_id: TconnId<Io>) {
		let _span = tracing::trace_span!("signal_reconnect", trunk = %self.name, tconn = ?tconn_id).entered();
		if let Some(tconn) = self.tconns.get_mut(tconn_id) {
			tconn.state = ConnState::Draining;
			tconn.connection.reconnect();
		}
		self.requeue_live_requests(tconn_id, CancelReason::Move);
		self.drain_notify();
	}

	/// Explicitly cancel `treq_id`. If it was never sent, or the application has no cancel-mux
	/// support, it is silently detached and failed. Otherwise it enters the cancel pipeline.
	pub fn signal_cancel(&mut self, treq_id: TreqId<Io>) {
		let _span = tracing::trace_span!("signal_cancel", trunk = %self.name, treq = ?treq_id).entered();
		let state = match self.treqs.get(treq_id) {
			Some(t) => t.state,
			None => return,
		};
		if state.is_terminal() {
			return;
		}
		let was_in_flight = matches!(state, ReqState::Sent | ReqState::Partial);
		if !self.io.supports_cancel_mux() || !was_in_flight {
			if let Some(tconn_id) = self.treqs.get(treq_id).and_then(|t| t.tconn) {
				self.detach_from_tconn(treq_id, tconn_id);
			} else {
				self.backlog.remove_first(|id| *id == treq_id);
			}
			self.fail_treq(treq_id);
		} else {
			let treq_span = self.treqs.get(treq_id).map(|t| t.span.clone());
			let request = {
				let _enter = treq_span.as_ref().map(|s| s.enter());
				let tconn_id = self.treqs.get(treq_id).and_then(|t| t.tconn);
				if let Some(tconn_id) = tconn_id {
					if let Some(tconn) = self.tconns.get_mut(tconn_id) {
						tconn.sent.shift_remove(&treq_id);
						if tconn.partial == Some(treq_id) {
							tconn.partial = None;
						}
						let sequence = self.treqs.get(treq_id).map(|t| t.sequence).unwrap_or(0);
						let Self { tconns, treqs, io, .. } = self;
						if let Some(tconn) = tconns.get_mut(tconn_id) {
							tconn.cancel.insert(treq_id, sequence, |a, b| compare_treqs(io, treqs, a, b));
							tconn.notify_dirty = true;
						}
					}
				}
				let request = self.treqs.get_mut(treq_id).and_then(|t| t.request.take());
				if let Some(t) = self.treqs.get_mut(treq_id) {
					debug_assert!(
						matches!(t.state, ReqState::Sent | ReqState::Partial),
						"signal_cancel's cancel-mux branch entered from a state other than Sent/Partial",
					);
					t.state = ReqState::Cancel;
					t.cancel_reason = CancelReason::Signal;
				}
				tracing::trace!("moved to cancel pipeline");
				request
			};
			self.io.request_cancel(treq_id, request, CancelReason::Signal);
		}
		self.drain_notify();
	}

	/// Remove `treq_id` from whichever queue of `tconn_id` currently holds it.
	fn detach_from_tconn(&mut self, treq_id: TreqId<Io>, tconn_id: TconnId<Io>) {
		if let Some(tconn) = self.tconns.get_mut(tconn_id) {
			tconn.pending.remove_first(|id| *id == treq_id);
			if tconn.partial == Some(treq_id) {
				tconn.partial = None;
			}
			tconn.sent.shift_remove(&treq_id);
			tconn.notify_dirty = true;
		}
	}

	/// Move `partial ∪ pending ∪ sent` of `tconn_id` back to `Unassigned` and attempt to
	/// re-route each in its original priority order (§4.2). Requests already in a cancel state
	/// are finalized as failed instead of re-routed, since the remote side has no record to
	/// clean up from this side's perspective (§4.2, §5).
	fn requeue_live_requests(&mut self, tconn_id: TconnId<Io>, reason: CancelReason) {
		let (mut live, cancelling) = match self.tconns.get_mut(tconn_id) {
			Some(tconn) => {
				let mut live: Vec<TreqId<Io>> = tconn.pending.drain().collect();
				if let Some(partial) = tconn.partial.take() {
					live.push(partial);
				}
				live.extend(tconn.sent.drain(..));
				let cancelling: Vec<TreqId<Io>> = tconn.cancel.drain()
					.chain(tconn.cancel_partial.take())
					.chain(tconn.cancel_sent.drain(..))
					.collect();
				(live, cancelling)
			},
			None => (Vec::new(), Vec::new()),
		};
		live.sort_by_key(|id| self.treqs.get(*id).map(|t| t.sequence).unwrap_or(u64::MAX));

		for treq_id in cancelling {
			let rctx = match self.treqs.get_mut(treq_id) {
				Some(treq) => {
					treq.state = ReqState::Failed;
					treq.rctx.take()
				},
				None => continue,
			};
			if let Some(rctx) = rctx {
				self.io.request_fail(treq_id, rctx);
			}
			self.reap(treq_id);
		}

		for treq_id in live {
			if let Some(t) = self.treqs.get_mut(treq_id) {
				t.state = ReqState::Unassigned;
				t.tconn = None;
				t.cancel_reason = reason;
			}
			let request = self.treqs.get_mut(treq_id).and_then(|t| t.request.take());
			self.io.request_cancel(treq_id, request, reason);
			let outcome = self.route(treq_id);
			if matches!(outcome, EnqueueOutcome::NoCapacity | EnqueueOutcome::DstUnavailable | EnqueueOutcome::Fail) {
				self.fail_treq(treq_id);
			}
		}
	}

	/// Drain the callbacks queued by the last mux/demux/cancel-mux dispatch, calling into `Io`
	/// now that the dispatch itself has returned and no overlapping borrow is in play (§4.6).
	fn drain_callbacks(&mut self) {
		while let Some(callback) = self.pending_callbacks.pop() {
			match callback {
				PendingCallback::Complete { treq, rctx } => {
					self.io.request_complete(treq, rctx);
					self.reap(treq);
				},
				PendingCallback::Fail { treq, rctx } => {
					self.io.request_fail(treq, rctx);
					self.reap(treq);
				},
			}
		}
	}

	/// Move a terminal treq onto the free list: it sits `Reapable` until `req_cleanup_delay`
	/// has passed, at which point [`Trunk::release_reapable`] hands its payload back via
	/// `request_free` and removes it from the arena.
	fn reap(&mut self, treq_id: TreqId<Io>) {
		let now = self.clock.now();
		if let Some(treq) = self.treqs.get_mut(treq_id) {
			let _enter = treq.span().clone().entered();
			debug_assert!(treq.state.is_terminal(), "reap on a treq that hadn't reached a terminal state");
			tracing::trace!("moved to free list");
			treq.state = ReqState::Reapable;
			treq.reaped_at = Some(now);
		}
	}

	/// Call `connection_notify` once for every tconn whose computed `IoEvents` may have changed
	/// since the last drain, then clear the dirty flags.
	fn drain_notify(&mut self) {
		let always_writable = self.conf.always_writable;
		let dirty: Vec<TconnId<Io>> = self.tconns.iter()
			.filter(|(_, t)| t.notify_dirty)
			.map(|(id, _)| id)
			.collect();
		for tconn_id in dirty {
			let events = match self.tconns.get_mut(tconn_id) {
				Some(tconn) => {
					tconn.notify_dirty = false;
					tconn.io_events(always_writable)
				},
				None => continue,
			};
			self.io.connection_notify(tconn_id, events);
		}
	}

	// -- connection lifecycle ----------------------------------------------------------------

	/// Allocate a fresh connection and ask it to start connecting.
	fn spawn_connection(&mut self) -> Result<TconnId<Io>, TrunkError> {
		let connection = self.io.connection_alloc().ok_or(TrunkError::ConnectionAllocFailed)?;
		let now = self.clock.now();
		let id = self.tconns.insert_with(|id| Tconn::new(id, connection, now));
		if let Some(tconn) = self.tconns.get_mut(id) {
			tconn.connection.start();
			tconn.state = ConnState::Connecting;
		}
		tracing::debug!(trunk = %self.name, tconn = ?id, "spawned connection");
		Ok(id)
	}

	/// Poll every live connection for a watch-callback event and apply the corresponding state
	/// transition. Should be called once per event-loop tick (or whenever the caller knows a
	/// connection may have changed state), in addition to `manage_tick`.
	pub fn poll_connections(&mut self) {
		let ids: Vec<TconnId<Io>> = self.tconns.iter().map(|(id, _)| id).collect();
		for tconn_id in ids {
			let event = match self.tconns.get_mut(tconn_id) {
				Some(tconn) => tconn.connection.poll_event(),
				None => None,
			};
			match event {
				Some(ConnectionEvent::Connected) => {
					let now = self.clock.now();
					if let Some(tconn) = self.tconns.get_mut(tconn_id) {
						tconn.state = ConnState::Active;
						tconn.connected_at = Some(now);
						tconn.notify_dirty = true;
					}
					tracing::debug!(trunk = %self.name, tconn = ?tconn_id, "connected");
					self.drain_backlog_onto(tconn_id);
				},
				Some(ConnectionEvent::Failed) => {
					if let Some(tconn) = self.tconns.get_mut(tconn_id) {
						tconn.state = ConnState::Failed;
						tconn.notify_dirty = true;
					}
					tracing::warn!(trunk = %self.name, tconn = ?tconn_id, "connection failed");
					self.requeue_live_requests(tconn_id, CancelReason::Move);
				},
				Some(ConnectionEvent::Closed) => {
					let should_free = matches!(
						self.tconns.get(tconn_id).map(|t| t.state),
						Some(ConnState::Draining) | Some(ConnState::DrainingToFree) | Some(ConnState::Failed)
					);
					if should_free {
						self.tconns.remove(tconn_id);
						tracing::debug!(trunk = %self.name, tconn = ?tconn_id, "connection closed and freed");
					} else if let Some(tconn) = self.tconns.get_mut(tconn_id) {
						tconn.state = ConnState::Closed;
						tconn.notify_dirty = true;
					}
				},
				None => {},
			}
		}
		self.drain_notify();
	}

	// -- management loop ---------------------------------------------------------------------

	/// Run one tick of the management loop (§4.5): enforce `max_uses`/`lifetime`, enforce
	/// `min`, and apply open/close hysteresis based on recent utilisation.
	pub fn manage_tick(&mut self) {
		let _span = tracing::trace_span!("manage_tick", trunk = %self.name).entered();
		let now = self.clock.now();
		self.update_target_tracking(now);

		self.enforce_lifetime(now);
		self.enforce_min();
		self.maybe_open(now);
		self.maybe_close(now);
		self.release_reapable(now);

		self.drain_notify();
	}

	/// Release treqs that have sat `Reapable` for at least `req_cleanup_delay`, handing their
	/// payload back via `request_free` and removing them from the arena.
	fn release_reapable(&mut self, now: Instant) {
		let delay = self.conf.req_cleanup_delay;
		let due: Vec<TreqId<Io>> = self.treqs.iter()
			.filter(|(_, t)| {
				t.state == ReqState::Reapable
					&& t.reaped_at.map_or(false, |at| now.saturating_duration_since(at) >= delay)
			})
			.map(|(id, _)| id)
			.collect();
		for treq_id in due {
			if let Some(mut treq) = self.treqs.remove(treq_id) {
				let _enter = treq.span().clone().entered();
				tracing::trace!("releasing from free list");
				if let Some(preq) = treq.preq.take() {
					drop(_enter);
					self.io.request_free(treq_id, preq);
				}
			}
		}
	}

	fn active_average_load(&self) -> Option<f64> {
		let mut total = 0usize;
		let mut count = 0usize;
		for (_, tconn) in self.tconns.iter() {
			if tconn.state == ConnState::Active {
				total += tconn.load();
				count += 1;
			}
		}
		if count == 0 {
			None
		} else {
			Some(total as f64 / count as f64)
		}
	}

	fn update_target_tracking(&mut self, now: Instant) {
		if self.conf.target_req_per_conn == 0 {
			return;
		}
		let target = self.conf.target_req_per_conn as f64;
		// A non-empty backlog means every active connection is at or past capacity even if its
		// own load happens to read exactly at target, so fold it into the average rather than
		// requiring a strict excess only among already-active connections.
		let backlogged = self.backlog.len() as f64;
		match self.active_average_load() {
			Some(avg) if avg + backlogged >= target && (avg > target || backlogged > 0.0) => {
				self.above_target_since.get_or_insert(now);
				self.below_target_since = None;
			},
			Some(avg) if avg < target && backlogged == 0.0 => {
				self.below_target_since.get_or_insert(now);
				self.above_target_since = None;
			},
			_ => {
				self.above_target_since = None;
				self.below_target_since = None;
			},
		}
	}

	fn enforce_lifetime(&mut self, now: Instant) {
		let expired: Vec<TconnId<Io>> = self.tconns.iter()
			.filter(|(_, t)| {
				if !matches!(t.state, ConnState::Active | ConnState::Inactive) {
					return false;
				}
				let used_up = self.conf.max_uses > 0 && t.use_count >= self.conf.max_uses;
				let aged_out = self.conf.lifetime.map(|l| now.saturating_duration_since(t.opened_at) >= l).unwrap_or(false);
				used_up || aged_out
			})
			.map(|(id, _)| id)
			.collect();
		for tconn_id in expired {
			if let Some(tconn) = self.tconns.get_mut(tconn_id) {
				tconn.state = ConnState::DrainingToFree;
				tconn.notify_dirty = true;
			}
			tracing::debug!(trunk = %self.name, tconn = ?tconn_id, "draining to free: lifetime or use limit reached");
		}
	}

	fn enforce_min(&mut self) {
		let live = self.tconns.iter()
			.filter(|(_, t)| matches!(t.state, ConnState::Active | ConnState::Connecting))
			.count();
		let min = self.conf.min as usize;
		if live >= min {
			return;
		}
		let connecting = self.tconns.iter().filter(|(_, t)| t.state == ConnState::Connecting).count();
		let mut to_spawn = min - live;
		let headroom = (self.conf.connecting as usize).saturating_sub(connecting);
		to_spawn = to_spawn.min(headroom);
		for _ in 0..to_spawn {
			let _ = self.spawn_connection();
		}
	}

	fn maybe_open(&mut self, now: Instant) {
		let above_since = match self.above_target_since {
			Some(t) => t,
			None => return,
		};
		if now.saturating_duration_since(above_since) < self.conf.open_delay {
			return;
		}
		if self.non_closed_count() >= self.conf.max as usize {
			return;
		}
		let connecting = self.tconns.iter().filter(|(_, t)| t.state == ConnState::Connecting).count();
		if connecting >= self.conf.connecting as usize {
			return;
		}
		if self.spawn_connection().is_ok() {
			self.above_target_since = None;
		}
	}

	fn maybe_close(&mut self, now: Instant) {
		let below_since = match self.below_target_since {
			Some(t) => t,
			None => return,
		};
		if now.saturating_duration_since(below_since) < self.conf.close_delay {
			return;
		}
		let active = self.tconns.iter().filter(|(_, t)| t.state == ConnState::Active).count();
		if active <= self.conf.min as usize {
			return;
		}
		let weakest = self.tconns.iter()
			.filter(|(_, t)| t.state == ConnState::Active)
			.min_by_key(|(_, t)| t.load())
			.map(|(id, _)| id);
		if let Some(tconn_id) = weakest {
			if let Some(tconn) = self.tconns.get_mut(tconn_id) {
				tconn.state = ConnState::Draining;
				tconn.notify_dirty = true;
			}
			tracing::debug!(trunk = %self.name, tconn = ?tconn_id, "draining: utilisation below target");
			self.below_target_since = None;
		}
	}
}
