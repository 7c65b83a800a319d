//! Wire contract for resumable transfers.
//!
//! Holds the header vocabulary of the two-phase upload protocol, parsers for
//! the server's reply lines, the chunk sizing heuristic shared by both
//! engines, and the value types reported back to callers.

pub mod constants;
pub mod types;
pub mod wire;

// Re-export primary types for convenience.
pub use constants::{Action, chunk_size};
pub use types::{ErrorCode, LocalArtifact, TransferEvent, TransferFailure, TransferKind};
pub use wire::{HandshakeReply, ReturnCode, WireError};
