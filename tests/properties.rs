//! Property-based tests of the dispatcher invariants (state-membership, cardinality, and
//! exactly-once teardown) under randomized traffic, using the in-memory harness from
//! `support/mod.rs`.

mod support;

use std::collections::HashSet;

use proptest::prelude::*;

use trunk::clock::FakeClock;
use trunk::config::TrunkConfig;
use trunk::connection::ConnectionEvent;
use trunk::request::ReqState;
use trunk::Trunk;

use support::{Harness, HandleRegistry};

const REQ_STATES: &[ReqState] = &[
	ReqState::Unassigned,
	ReqState::Backlog,
	ReqState::Pending,
	ReqState::Partial,
	ReqState::Sent,
	ReqState::Reapable,
	ReqState::Cancel,
	ReqState::CancelPartial,
	ReqState::CancelSent,
	ReqState::Complete,
	ReqState::Failed,
];

#[derive(Debug, Clone, Copy)]
enum Action {
	Enqueue,
	Writable,
	Complete(usize),
	Fail(usize),
	Cancel(usize),
	CancelAck(usize),
}

fn action_strategy() -> impl Strategy<Value = Action> {
	prop_oneof![
		3 => Just(Action::Enqueue),
		3 => Just(Action::Writable),
		2 => (0usize..8).prop_map(Action::Complete),
		1 => (0usize..8).prop_map(Action::Fail),
		2 => (0usize..8).prop_map(Action::Cancel),
		1 => (0usize..8).prop_map(Action::CancelAck),
	]
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(64))]

	/// Invariants 3 and 5 of the data model: the per-state request counts always sum to the
	/// total live count (every treq lives in exactly one bucket), and `request_free` is never
	/// called twice for the same treq, under an arbitrary interleaving of enqueue/writable/
	/// readable/cancel traffic on a single connection.
	#[test]
	fn state_counts_and_teardown_hold_under_random_traffic(
		actions in prop::collection::vec(action_strategy(), 0..60),
		cancel_mux in any::<bool>(),
		max_req in 0u32..4,
	) {
		let conf = TrunkConfig {
			start: 1,
			min: 1,
			max: 1,
			connecting: 1,
			max_req_per_conn: max_req,
			always_writable: true,
			..TrunkConfig::default()
		};
		let registry = HandleRegistry::new();
		let harness = if cancel_mux { Harness::with_cancel_mux(registry.clone()) } else { Harness::new(registry.clone()) };
		let mut trunk = Trunk::new("prop-state", conf, harness, Box::new(FakeClock::new())).expect("valid config");

		registry.get(0).push(ConnectionEvent::Connected);
		trunk.poll_connections();
		let tconn_id = trunk.tconn_ids()[0];

		let mut next_req = 0u32;

		for action in actions {
			match action {
				Action::Enqueue => {
					let _ = trunk.enqueue(next_req, format!("p{next_req}"), None);
					next_req += 1;
				},
				Action::Writable => trunk.signal_writable(tconn_id),
				Action::Complete(idx) | Action::Fail(idx) => {
					let ids = trunk.treq_ids();
					if !ids.is_empty() {
						let treq_id = ids[idx % ids.len()];
						let success = matches!(action, Action::Complete(_));
						trunk.io_mut().queue_response(tconn_id, treq_id, success);
						trunk.signal_readable(tconn_id);
					}
				},
				Action::Cancel(idx) => {
					let ids = trunk.treq_ids();
					if !ids.is_empty() {
						trunk.signal_cancel(ids[idx % ids.len()]);
					}
				},
				Action::CancelAck(idx) => {
					let ids = trunk.treq_ids();
					if !ids.is_empty() {
						let treq_id = ids[idx % ids.len()];
						trunk.io_mut().queue_cancel_ack(tconn_id, treq_id);
						trunk.signal_readable(tconn_id);
					}
				},
			}

			let total: usize = REQ_STATES.iter().map(|&s| trunk.request_count(s)).sum();
			prop_assert_eq!(total, trunk.request_count_total());

			prop_assert!(trunk.request_count_on(tconn_id, ReqState::Partial) <= 1);
			prop_assert!(trunk.request_count_on(tconn_id, ReqState::CancelPartial) <= 1);
		}

		let freed = &trunk.io().log.freed;
		let unique: HashSet<_> = freed.iter().copied().collect();
		prop_assert_eq!(freed.len(), unique.len());
	}

	/// Invariant 7: the default FIFO priority is stable — requests enqueued (and thus assigned
	/// the same tconn) in a given order are reported sent by `request_mux` in that same order,
	/// regardless of how many writable opportunities it takes to drain them.
	#[test]
	fn fifo_order_is_preserved_through_partial_drains(
		batch_sizes in prop::collection::vec(1usize..4, 1..8),
	) {
		let conf = TrunkConfig {
			start: 1,
			min: 1,
			max: 1,
			connecting: 1,
			always_writable: true,
			..TrunkConfig::default()
		};
		let registry = HandleRegistry::new();
		let harness = Harness::new(registry.clone());
		let mut trunk = Trunk::new("prop-fifo", conf, harness, Box::new(FakeClock::new())).expect("valid config");

		registry.get(0).push(ConnectionEvent::Connected);
		trunk.poll_connections();
		let tconn_id = trunk.tconn_ids()[0];

		let mut next_req = 0u32;
		let mut enqueue_order = Vec::new();
		for batch in batch_sizes {
			for _ in 0..batch {
				let outcome = trunk.enqueue(next_req, format!("p{next_req}"), None);
				if outcome == trunk::error::EnqueueOutcome::Ok {
					enqueue_order.push(trunk.treq_ids().last().copied().expect("just enqueued"));
				}
				next_req += 1;
			}
			trunk.signal_writable(tconn_id);
		}

		let sent_order = &trunk.io().log.mux_order;
		prop_assert_eq!(sent_order, &enqueue_order);
	}
}
