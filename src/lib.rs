//! xdooria-fabric: the distributed online-game backend (Gateway/Login/Game
//! over TCP + gRPC, Raft consensus, gossip membership, Redis-arbitrated
//! presence). Each binary in `src/bin/` wires a subset of these modules
//! into a running service via [`app::Application`].

pub mod app;
pub mod backoff;
pub mod balancer;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod game;
pub mod gateway;
pub mod login;
pub mod metrics;
pub mod opcode;
pub mod pb;
pub mod presence;
pub mod raft;
pub mod registry;
pub mod router;
pub mod session;
