//! Game node (§4.7, §4.9): the `GameStream` traffic endpoint and the
//! `RaftTransport` endpoint share one process.

pub mod raft_service;
pub mod stream_service;

pub use raft_service::RaftTransportService;
pub use stream_service::GameStreamService;
