//! # Utility Functions and Types
//!
//! CRC utilities used by PSI section synthesis.
//!
//! ```rust
//! use splicecore::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let data = b"Hello, world!";
//! let checksum = crc.calculate(data);
//! println!("CRC32: {:08x}", checksum);
//! ```

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use crc::Crc32Mpeg2;
