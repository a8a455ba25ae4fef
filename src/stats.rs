//! Read-only statistics queries (§6): connection counts by state, request counts by connection
//! or by trunk.

use crate::connection::{ConnState, TconnId};
use crate::io::TrunkIo;
use crate::request::ReqState;
use crate::trunk::Trunk;

impl<Io: TrunkIo> Trunk<Io> {
	/// Number of tconns currently in `state`.
	pub fn connection_count(&self, state: ConnState) -> usize {
		self.tconns_iter().filter(|(_, s)| *s == state).count()
	}

	/// Total number of tconns, regardless of state.
	pub fn connection_count_total(&self) -> usize {
		self.tconns_iter().count()
	}

	/// Number of treqs belonging to `tconn_id` currently in `state`.
	pub fn request_count_on(&self, tconn_id: TconnId<Io>, state: ReqState) -> usize {
		self.treqs_iter()
			.filter(|(_, s, tconn)| *s == state && *tconn == Some(tconn_id))
			.count()
	}

	/// Number of treqs trunk-wide currently in `state`.
	pub fn request_count(&self, state: ReqState) -> usize {
		self.treqs_iter().filter(|(_, s, _)| *s == state).count()
	}

	/// Total number of treqs trunk-wide, regardless of state.
	pub fn request_count_total(&self) -> usize {
		self.treqs_iter().count()
	}
}
