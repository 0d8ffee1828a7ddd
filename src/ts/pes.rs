use bytes::{BufMut, BytesMut};
use crate::error::{Result, SpliceError};
#[cfg(test)]
use super::types::time_to_pts;
#[cfg(test)]
use std::time::Duration;

/// Mask for the 33-bit PTS/DTS field; rebasing wraps at this boundary.
pub const PTS_DTS_MASK: u64 = 0x1_FFFF_FFFF;

#[derive(Debug, Clone)]
pub struct PESHeader {
    pub start_code_prefix: u32,  // Always 0x000001
    pub stream_id: u8,
    pub packet_length: u16,
    pub scrambling_control: u8,
    pub priority: bool,
    pub data_alignment: bool,
    pub copyright: bool,
    pub original: bool,
    pub pts_dts_flags: u8,
    pub escr_flag: bool,
    pub es_rate_flag: bool,
    pub dsm_trick_mode_flag: bool,
    pub additional_copy_info_flag: bool,
    pub crc_flag: bool,
    pub extension_flag: bool,
    pub header_data_length: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
}

impl Default for PESHeader {
    fn default() -> Self {
        Self {
            start_code_prefix: 0x000001,
            stream_id: 0,
            packet_length: 0,
            scrambling_control: 0,
            priority: false,
            data_alignment: false,
            copyright: false,
            original: false,
            pts_dts_flags: 0,
            escr_flag: false,
            es_rate_flag: false,
            dsm_trick_mode_flag: false,
            additional_copy_info_flag: false,
            crc_flag: false,
            extension_flag: false,
            header_data_length: 0,
            pts: None,
            dts: None,
        }
    }
}

impl PESHeader {
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    /// Parses a PES header from the start of a PES packet, returning the
    /// header and the byte offset where the elementary stream payload
    /// begins. `pts`/`dts` are left in raw 90kHz ticks, matching
    /// [`with_pts`](Self::with_pts)'s internal representation.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 9 {
            return Err(SpliceError::Pes("PES header too short".into()));
        }
        let start_code_prefix =
            ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32;
        if start_code_prefix != 0x000001 {
            return Err(SpliceError::Pes("missing PES start code".into()));
        }

        let flags = data[6];
        let flags2 = data[7];
        let header_data_length = data[8];
        let pts_dts_flags = flags & 0xC0;

        let mut header = Self {
            start_code_prefix,
            stream_id: data[3],
            packet_length: ((data[4] as u16) << 8) | data[5] as u16,
            scrambling_control: (flags >> 6) & 0x03,
            priority: (flags & 0x20) != 0,
            data_alignment: (flags & 0x10) != 0,
            copyright: (flags & 0x08) != 0,
            original: (flags & 0x04) != 0,
            pts_dts_flags,
            escr_flag: (flags2 & 0x20) != 0,
            es_rate_flag: (flags2 & 0x10) != 0,
            dsm_trick_mode_flag: (flags2 & 0x08) != 0,
            additional_copy_info_flag: (flags2 & 0x04) != 0,
            crc_flag: (flags2 & 0x02) != 0,
            extension_flag: (flags2 & 0x01) != 0,
            header_data_length,
            pts: None,
            dts: None,
        };

        let mut pos = 9usize;
        if pts_dts_flags & 0x80 != 0 {
            header.pts = Some(read_timestamp(data, pos)?);
            pos += 5;
            if pts_dts_flags == 0xC0 {
                header.dts = Some(read_timestamp(data, pos)?);
                pos += 5;
            }
        }

        let payload_offset = 9 + header_data_length as usize;
        let _ = pos;
        Ok((header, payload_offset))
    }

    /// Byte offset of the PTS field within the PES header, if present.
    pub fn pts_offset(&self) -> Option<usize> {
        (self.pts_dts_flags & 0x80 != 0).then_some(9)
    }

    /// Byte offset of the DTS field within the PES header, if present.
    pub fn dts_offset(&self) -> Option<usize> {
        (self.pts_dts_flags == 0xC0).then_some(14)
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        // Start code prefix (3 bytes) - manually writing 24 bits
        buf.put_u8((self.start_code_prefix >> 16) as u8);
        buf.put_u8((self.start_code_prefix >> 8) as u8);
        buf.put_u8(self.start_code_prefix as u8);
        
        // Stream ID (1 byte)
        buf.put_u8(self.stream_id);
        
        // PES packet length (2 bytes)
        buf.put_u16(self.packet_length);
        
        // Flags (1 byte)
        let mut flags = 0u8;
        flags |= self.scrambling_control << 6;
        if self.priority { flags |= 0x20; }
        if self.data_alignment { flags |= 0x10; }
        if self.copyright { flags |= 0x08; }
        if self.original { flags |= 0x04; }
        flags |= self.pts_dts_flags;
        buf.put_u8(flags);
        
        // Additional flags (1 byte)
        let mut flags2 = 0u8;
        if self.escr_flag { flags2 |= 0x20; }
        if self.es_rate_flag { flags2 |= 0x10; }
        if self.dsm_trick_mode_flag { flags2 |= 0x08; }
        if self.additional_copy_info_flag { flags2 |= 0x04; }
        if self.crc_flag { flags2 |= 0x02; }
        if self.extension_flag { flags2 |= 0x01; }
        buf.put_u8(flags2);
        
        // Header data length (1 byte): derived from what actually follows,
        // rather than trusting a field a builder might forget to update.
        let header_data_length = (if self.pts.is_some() { 5 } else { 0 })
            + (if self.dts.is_some() { 5 } else { 0 });
        buf.put_u8(header_data_length);
        
        // Write PTS if present
        if let Some(pts) = self.pts {
            let marker = if self.dts.is_some() { 0x30 } else { 0x20 };
            write_timestamp(buf, marker, pts)?;
        }
        
        // Write DTS if present
        if let Some(dts) = self.dts {
            write_timestamp(buf, 0x10, dts)?;
        }
        
        Ok(())
    }
}

/// Writes a 5-byte PTS/DTS field with marker bits, matching [`PESHeader::write_to`]'s
/// layout. Exposed for callers (the splicer's SPS/PPS injection PES) that build a
/// minimal PES header by hand rather than through `PESHeader`.
pub fn write_pts_only(buf: &mut BytesMut, marker: u8, pts: u64) -> Result<()> {
    write_timestamp(buf, marker, pts)
}

// Helper function to write PTS/DTS timestamps
fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: u64) -> Result<()> {
    let pts = ts & PTS_DTS_MASK;

    // First byte: marker bits and 3 MSB of timestamp
    buf.put_u8(marker | ((pts >> 29) & 0x0E) as u8 | 0x01);

    // Middle 16 bits and marker
    buf.put_u16((((pts >> 14) & 0xFFFE) | 0x01) as u16);

    // Final 15 bits and marker
    buf.put_u16((((pts << 1) & 0xFFFE) | 0x01) as u16);

    Ok(())
}

/// Reads a 5-byte PTS/DTS field (marker bits included) starting at `offset`.
fn read_timestamp(data: &[u8], offset: usize) -> Result<u64> {
    if data.len() < offset + 5 {
        return Err(SpliceError::Pes("truncated PTS/DTS field".into()));
    }
    let b = &data[offset..offset + 5];
    let ts = (((b[0] as u64) & 0x0E) << 29)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64) & 0xFE) << 14)
        | ((b[3] as u64) << 7)
        | (((b[4] as u64) & 0xFE) >> 1);
    Ok(ts & PTS_DTS_MASK)
}

/// Overwrites an existing 5-byte PTS/DTS field in place, preserving its
/// marker bits. Used by the splicer to rebase a timestamp without
/// re-serializing the rest of the PES header.
pub fn rewrite_timestamp_in_place(data: &mut [u8], offset: usize, marker: u8, ts: u64) -> Result<()> {
    if data.len() < offset + 5 {
        return Err(SpliceError::Pes("truncated PTS/DTS field".into()));
    }
    let pts = ts & PTS_DTS_MASK;
    data[offset] = marker | ((pts >> 29) & 0x0E) as u8 | 0x01;
    data[offset + 1] = ((pts >> 22) & 0xFF) as u8;
    data[offset + 2] = (((pts >> 14) & 0x7F) << 1 | 0x01) as u8;
    data[offset + 3] = ((pts >> 7) & 0xFF) as u8;
    data[offset + 4] = (((pts << 1) & 0xFE) | 0x01) as u8;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a header with an optional PTS/DTS and writes it followed by
    /// `payload`, the way a caller of this module's low-level API would.
    fn write_pes(buf: &mut BytesMut, stream_id: u8, payload: &[u8], pts: Option<Duration>, dts: Option<Duration>) {
        let mut header = PESHeader::new(stream_id);
        if let Some(pts) = pts {
            header.pts = Some(time_to_pts(pts));
            header.pts_dts_flags |= 0x80;
        }
        if let Some(dts) = dts {
            header.dts = Some(time_to_pts(dts));
            header.pts_dts_flags |= 0x40;
        }
        header.write_to(buf).unwrap();
        buf.extend_from_slice(payload);
    }

    #[test]
    fn write_to_emits_start_code_and_stream_id() {
        let mut buf = BytesMut::new();
        write_pes(&mut buf, 0xe0, &[0; 10], Some(Duration::from_secs(1)), None);

        assert_eq!(&buf[0..3], &[0x00, 0x00, 0x01]);
        assert_eq!(buf[3], 0xe0);
    }

    #[test]
    fn parse_recovers_pts_and_dts_written_by_write_to() {
        let mut buf = BytesMut::new();
        write_pes(
            &mut buf,
            0xe0,
            &[1, 2, 3],
            Some(Duration::from_secs(2)),
            Some(Duration::from_millis(1900)),
        );

        let (header, payload_offset) = PESHeader::parse(&buf).unwrap();
        assert_eq!(header.stream_id, 0xe0);
        assert_eq!(header.pts, Some(time_to_pts(Duration::from_secs(2))));
        assert_eq!(header.dts, Some(time_to_pts(Duration::from_millis(1900))));
        assert_eq!(header.pts_offset(), Some(9));
        assert_eq!(header.dts_offset(), Some(14));
        assert_eq!(&buf[payload_offset..], &[1, 2, 3][..]);
    }

    #[test]
    fn parse_pts_only_header_has_no_dts_offset() {
        let mut buf = BytesMut::new();
        write_pes(&mut buf, 0xe0, &[], Some(Duration::from_secs(1)), None);

        let (header, _) = PESHeader::parse(&buf).unwrap();
        assert!(header.pts.is_some());
        assert!(header.dts.is_none());
        assert_eq!(header.pts_offset(), Some(9));
        assert_eq!(header.dts_offset(), None);
    }

    #[test]
    fn rewrite_timestamp_in_place_updates_value_and_keeps_marker_bits() {
        let mut buf = BytesMut::new();
        write_pes(
            &mut buf,
            0xe0,
            &[0xAA],
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(1)),
        );
        let mut raw = buf.to_vec();

        let new_pts = time_to_pts(Duration::from_secs(5));
        rewrite_timestamp_in_place(&mut raw, 9, 0x30, new_pts).unwrap();

        let (header, _) = PESHeader::parse(&raw).unwrap();
        assert_eq!(header.pts, Some(new_pts & PTS_DTS_MASK));
        // marker/reserved nibble and every stop bit must still read back valid.
        assert_eq!(raw[9] & 0xF0, 0x30);
        assert_eq!(raw[9] & 0x01, 0x01);
        assert_eq!(raw[11] & 0x01, 0x01);
        assert_eq!(raw[13] & 0x01, 0x01);
    }

    #[test]
    fn rewrite_timestamp_in_place_rejects_truncated_buffer() {
        let mut raw = vec![0u8; 12];
        assert!(rewrite_timestamp_in_place(&mut raw, 9, 0x20, 0).is_err());
    }
}