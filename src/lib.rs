#![doc(html_root_url = "https://docs.rs/splicecore/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

//! # splicecore
//!
//! `splicecore` is a Transport Stream splicing core: it takes two MPEG-2 TS
//! sources (a primary "live" feed and a fallback feed) and produces a single
//! continuous, decoder-legal output stream, switching between sources at
//! safe cut points and rebasing every timestamp so the seam is invisible to
//! a downstream player.
//!
//! It is not a general-purpose container toolkit. It assumes H.264 video and
//! ADTS AAC audio carried over MPEG-2 TS, and it never transcodes: splicing
//! is purely a matter of finding IDR-aligned cut points, rewriting PCR/PTS/DTS
//! and continuity counters, and re-synthesizing PAT/PMT/SPS/PPS at the seam.
//!
//! ## Pipeline
//!
//! ```text
//! ingress bytes -> Reassembler -> StreamProbe -> SpliceDetector -> SourceBuffer
//!                                                                        |
//!                          Orchestrator (mode arbitration) <-------------+
//!                                   |
//!                                Splicer -> Sink -> egress bytes
//! ```
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! splicecore = "0.1.0"
//! ```
//!
//! ```rust
//! use splicecore::ts::reassembler::Reassembler;
//!
//! let mut reassembler = Reassembler::new(1 << 20);
//! reassembler.push_bytes(&[0x47; 188]);
//! let packets = reassembler.drain_packets();
//! assert_eq!(packets.len(), 1);
//! ```
//!
//! ## Module Overview
//!
//! - `ts`: Transport Stream packet model, PSI parsing, PES framing, and the
//!   splicing-specific components (`reassembler`, `probe`, `splice_detector`,
//!   `source_buffer`, `splicer`). `splice_detector` does its own H.264
//!   NAL/SPS/PPS scanning to find IDR boundaries and extract parameter sets.
//! - `orchestrator`: Dual-source mode arbitration (live/fallback failover,
//!   privacy override).
//! - `sink`: Ordered, blocking output writer.
//! - `monitor`: Optional PCR/PTS/DTS monotonicity diagnostics.
//! - `privacy`: Privacy override gate consulted by the orchestrator.
//! - `error`: Error types and the crate-wide `Result` alias.
//! - `utils`: CRC32/MPEG-2 calculation.
//! - `config`: Tunables, loaded from defaults, an optional TOML file, and
//!   environment variables.

/// Configuration: defaults, TOML file, environment overrides.
pub mod config;

/// Error types and the crate-wide `Result` alias.
pub mod error;

/// Dual-source mode arbitration (live/fallback failover, privacy override).
pub mod orchestrator;

/// Optional PCR/PTS/DTS monotonicity diagnostics.
pub mod monitor;

/// Privacy override gate consulted by the orchestrator.
pub mod privacy;

/// Ordered, blocking output writer.
pub mod sink;

/// Transport Stream packet model and splicing components.
pub mod ts;

/// Common utilities: CRC32/MPEG-2.
pub mod utils;

pub use error::{Result, SpliceError};
