//! # Error Types
//!
//! This module provides the error types used throughout the splicecore library.
//! It defines a central error type `SpliceError` that encapsulates the failures
//! that escape a component boundary during splicing.
//!
//! Most failure kinds the design calls out (`SyncLoss`, `AudioSyncTimeout`) are
//! absorbed locally as counters or degraded readiness states and never become a
//! `SpliceError` — see each component's module docs for which stay internal.
//!
//! ## Example Usage
//!
//! ```rust
//! use splicecore::error::{Result, SpliceError};
//!
//! fn validate_packet(data: &[u8]) -> Result<()> {
//!     if data.first() != Some(&0x47) {
//!         return Err(SpliceError::InvalidPacket("missing sync byte".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for the splicecore library.
#[derive(Error, Debug)]
pub enum SpliceError {
    /// I/O errors from an ingress or egress transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet handed to a component that assumes alignment was not aligned.
    ///
    /// Per the design this is conceptually unreachable once a snapshot has been
    /// taken from already-aligned packets; if it occurs it is treated as fatal.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A PAT or PMT section failed to parse or its CRC did not validate.
    #[error("psi error: {0}")]
    Psi(String),

    /// A PES header failed to parse past the point a component can recover from.
    #[error("pes error: {0}")]
    Pes(String),

    /// Neither source produced a usable `StreamInfo`/splice anchor within budget.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The output sink failed to write; fatal, triggers orchestrator shutdown.
    #[error("sink write failure: {0}")]
    Sink(String),

    /// Configuration failed to load or validate.
    #[error("config error: {0}")]
    Config(String),
}

/// A specialized `Result` type for splicecore operations.
pub type Result<T> = std::result::Result<T, SpliceError>;
