//! Stateful managers for the Tessera runtime
//!
//! Session bookkeeping for join-party attempts and the lifecycle of the
//! transport streams they borrow.

pub mod session;
pub mod streams;

pub use session::{Finalized, JoinMode, PeerSession, SessionRegistry};
pub use streams::StreamManager;
