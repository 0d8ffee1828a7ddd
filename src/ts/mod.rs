//! # MPEG Transport Stream splicing pipeline
//!
//! Submodules are laid out in pipeline order: bytes come in through the
//! [`reassembler`], get classified by [`probe`], scanned for cut points by
//! [`splice_detector`], buffered per-source by [`source_buffer`], and
//! finally rewritten in place by [`splicer`] before the orchestrator hands
//! them to the sink.
//!
//! [`types`] and [`parser`] hold the packet/PSI model shared by all of the
//! above; [`pes`] holds the PES header codec used by the splicer and the
//! splice detector's audio/video framing.

/// PAT/PMT section parsing.
pub mod parser;

/// PES header parsing and writing (PTS/DTS codec).
pub mod pes;

/// Core TS types: `TsPacket`, PAT/PMT, adaptation field, PCR/PTS conversions.
pub mod types;

/// Byte-stream to TS-packet resynchronization.
pub mod reassembler;

/// PAT/PMT folding into a `StreamInfo` snapshot.
pub mod probe;

/// IDR/audio-sync scanning and `SpliceAnchor` construction.
pub mod splice_detector;

/// Per-source rolling buffer and readiness gating.
pub mod source_buffer;

/// Stateful timestamp rebasing, continuity-counter regeneration, and
/// PAT/PMT/SPS/PPS synthesis.
pub mod splicer;

pub use pes::PESHeader;
pub use probe::{StreamInfo, StreamProbe};
pub use reassembler::Reassembler;
pub use source_buffer::{RollingBuffer, SourceBuffer};
pub use splice_detector::{SpliceAnchor, SpliceDetector};
pub use splicer::{Splicer, SplicerState};
pub use types::{
    TsPacket, PID_AUDIO, PID_PAT, PID_PMT, PID_VIDEO, STREAM_TYPE_AAC, STREAM_TYPE_H264,
    STREAM_TYPE_H265, TS_PACKET_SIZE,
};
