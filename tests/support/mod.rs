//! In-memory test harness: a fake connection engine and [`TrunkIo`] implementation standing in
//! for a real protocol codec and connection engine, so the trunk's own behaviour can be
//! exercised without a socket layer.
//!
//! Responses are not actually parsed off a wire — tests queue the outcome they want
//! (`Harness::queue_response`) and the harness's `request_demux` reports exactly that when the
//! trunk signals the matching tconn readable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use trunk::connection::{Connection, ConnectionEvent, IoEvents, TconnId};
use trunk::io::{CancelMuxContext, DemuxContext, MuxContext, TrunkIo};
use trunk::request::{CancelReason, TreqId};

/// A handle a test keeps to a connection's event queue, independent of the `Harness` which was
/// moved into the `Trunk`. Lets a test simulate the connection engine reporting `Connected`/
/// `Failed`/`Closed` at a time of its choosing.
#[derive(Clone, Default)]
pub struct ConnectionHandle(Rc<RefCell<VecDeque<ConnectionEvent>>>);

impl ConnectionHandle {
	pub fn push(&self, event: ConnectionEvent) {
		self.0.borrow_mut().push_back(event);
	}
}

pub struct FakeConnection {
	events: Rc<RefCell<VecDeque<ConnectionEvent>>>,
	pub started: bool,
	pub reconnects: u32,
	pub closed: bool,
}

impl Connection for FakeConnection {
	fn start(&mut self) {
		self.started = true;
	}

	fn reconnect(&mut self) {
		self.reconnects += 1;
	}

	fn close(&mut self) {
		self.closed = true;
	}

	fn poll_event(&mut self) -> Option<ConnectionEvent> {
		self.events.borrow_mut().pop_front()
	}
}

/// Every connection `Harness::connection_alloc` has ever produced, in allocation order, kept
/// alive independently of the `Harness` so a test can still reach them after handing the
/// harness to a `Trunk`.
#[derive(Clone, Default)]
pub struct HandleRegistry(Rc<RefCell<Vec<ConnectionHandle>>>);

impl HandleRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, index: usize) -> ConnectionHandle {
		self.0.borrow()[index].clone()
	}

	pub fn len(&self) -> usize {
		self.0.borrow().len()
	}

	fn push(&self, handle: ConnectionHandle) {
		self.0.borrow_mut().push(handle);
	}
}

/// What the harness's `TrunkIo` callbacks have observed, for test assertions.
#[derive(Default)]
pub struct Log {
	pub completed: Vec<TreqId<Harness>>,
	pub failed: Vec<TreqId<Harness>>,
	pub freed: Vec<TreqId<Harness>>,
	pub cancelled: Vec<(TreqId<Harness>, CancelReason)>,
	pub notifications: Vec<(TconnId<Harness>, IoEvents)>,
	/// Order in which `request_mux` reported requests fully written, across the whole run.
	pub mux_order: Vec<TreqId<Harness>>,
}

enum DemuxEvent {
	Response { success: bool },
	CancelAck,
}

pub struct Harness {
	pub log: Log,
	registry: HandleRegistry,
	cancel_mux: bool,
	responses: VecDeque<(TconnId<Harness>, TreqId<Harness>, DemuxEvent)>,
}

impl Harness {
	pub fn new(registry: HandleRegistry) -> Self {
		Self { log: Log::default(), registry, cancel_mux: false, responses: VecDeque::new() }
	}

	pub fn with_cancel_mux(registry: HandleRegistry) -> Self {
		Self { cancel_mux: true, ..Self::new(registry) }
	}

	/// Arrange for the next `request_demux` on `tconn` to report `treq` as complete (`success`)
	/// or failed.
	pub fn queue_response(&mut self, tconn: TconnId<Harness>, treq: TreqId<Harness>, success: bool) {
		self.responses.push_back((tconn, treq, DemuxEvent::Response { success }));
	}

	/// Arrange for the next `request_demux` on `tconn` to report a cancel-ack for `treq`.
	pub fn queue_cancel_ack(&mut self, tconn: TconnId<Harness>, treq: TreqId<Harness>) {
		self.responses.push_back((tconn, treq, DemuxEvent::CancelAck));
	}
}

impl TrunkIo for Harness {
	type Connection = FakeConnection;
	type Preq = String;
	type Rctx = Option<String>;
	type Request = u32;

	fn connection_alloc(&mut self) -> Option<Self::Connection> {
		let handle = ConnectionHandle::default();
		self.registry.push(handle.clone());
		Some(FakeConnection { events: handle.0, started: false, reconnects: 0, closed: false })
	}

	fn connection_notify(&mut self, tconn: TconnId<Self>, events: IoEvents) {
		self.log.notifications.push((tconn, events));
	}

	fn supports_cancel_mux(&self) -> bool {
		self.cancel_mux
	}

	fn request_mux(&mut self, _tconn: TconnId<Self>, ctx: &mut MuxContext<'_, Self>) {
		while let Some(treq) = ctx.pop_request() {
			self.log.mux_order.push(treq);
			ctx.signal_sent(treq);
		}
	}

	fn request_demux(&mut self, tconn: TconnId<Self>, ctx: &mut DemuxContext<'_, Self>) {
		let mut remaining = VecDeque::new();
		while let Some((queued_tconn, treq, event)) = self.responses.pop_front() {
			if queued_tconn == tconn {
				match event {
					DemuxEvent::Response { success: true } => ctx.signal_complete(treq),
					DemuxEvent::Response { success: false } => ctx.signal_fail(treq),
					DemuxEvent::CancelAck => ctx.signal_cancel_complete(treq),
				}
			} else {
				remaining.push_back((queued_tconn, treq, event));
			}
		}
		self.responses = remaining;
	}

	fn request_cancel_mux(&mut self, _tconn: TconnId<Self>, ctx: &mut CancelMuxContext<'_, Self>) {
		while let Some(treq) = ctx.pop_cancellation() {
			ctx.signal_cancel_sent(treq);
		}
	}

	fn request_cancel(&mut self, treq: TreqId<Self>, _request: Option<Self::Request>, reason: CancelReason) {
		self.log.cancelled.push((treq, reason));
	}

	fn request_complete(&mut self, treq: TreqId<Self>, rctx: Self::Rctx) {
		self.log.completed.push(treq);
		let _ = rctx;
	}

	fn request_fail(&mut self, treq: TreqId<Self>, rctx: Self::Rctx) {
		self.log.failed.push(treq);
		let _ = rctx;
	}

	fn request_free(&mut self, treq: TreqId<Self>, preq: Self::Preq) {
		self.log.freed.push(treq);
		let _ = preq;
	}
}
