//! Connection trunking: routes application requests across a managed pool of homogeneous
//! outbound connections.
//!
//! A [`Trunk`] sits between an application that calls [`Trunk::enqueue`] and a protocol/I-O
//! layer that serializes requests onto wire connections (the [`TrunkIo`] implementation the
//! application supplies). It owns the population of connections — how many exist, which are
//! accepting work, when to open or close one — and the routing of individual requests onto
//! those connections, including partial writes, cancellation, and redistribution when a
//! connection dies.
//!
//! Deliberately out of scope: the connection engine itself (state machine of one physical
//! connection, reconnection backoff, timers — see the [`Connection`](connection::Connection)
//! trait this crate consumes), the event loop (timers and fd readiness — see the
//! [`Clock`](clock::Clock) trait), and the wire protocol codec (the `request_mux`/
//! `request_demux` callbacks on [`TrunkIo`]).

#![warn(clippy::all)]

#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod io;
pub mod priority;
pub mod request;
pub mod stats;
pub mod trunk;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{ConfigError, TrunkConfig};
pub use connection::{ConnState, ConnStateMask, Connection, ConnectionEvent, IoEvents, Tconn, TconnId};
pub use error::{EnqueueOutcome, TrunkError};
pub use id::{Arena, Id};
pub use io::{CancelMuxContext, DemuxContext, MuxContext, TrunkIo};
pub use request::{CancelReason, ReqState, Treq, TreqId};
pub use trunk::Trunk;
