//! Stateful output-side rewriting: timestamp rebasing, continuity-counter
//! regeneration, PID normalization, and PAT/PMT/SPS+PPS synthesis at every
//! cut.
//!
//! One `Splicer` is owned by the orchestrator for the whole run; its
//! `SplicerState` is the only thing that carries across segments, which is
//! what makes successive cuts land on a continuous timeline.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::error::Result;
use crate::ts::pes::{rewrite_timestamp_in_place, PESHeader};
use crate::ts::types::{
    Descriptor, ElementaryStreamInfo, PATEntry, TSHeader, TsPacket, PAT, PMT, PID_AUDIO, PID_PAT,
    PID_PMT, PID_VIDEO, STREAM_ID_H264, TABLE_EXT_PAT, TABLE_ID_PAT, TABLE_ID_PMT, TS_HEADER_SIZE,
    TS_PACKET_SIZE,
};
use crate::utils::Crc32Mpeg2;

/// Output-global state that must survive across segments: the running PTS
/// and PCR offsets, and one continuity counter per output PID.
#[derive(Debug, Clone, Default)]
pub struct SplicerState {
    pub global_pts_offset: u64,
    pub global_pcr_offset: u64,
    continuity_counters: HashMap<u16, u8>,
}

/// Rebases timestamps, regenerates continuity counters, and synthesizes the
/// PSI/parameter-set packets a decoder needs at a cut.
#[derive(Debug)]
pub struct Splicer {
    state: SplicerState,
    program_number: u16,
    crc: Crc32Mpeg2,
}

impl Splicer {
    pub fn new(program_number: u16) -> Self {
        Self {
            state: SplicerState::default(),
            program_number,
            crc: Crc32Mpeg2::new(),
        }
    }

    pub fn state(&self) -> &SplicerState {
        &self.state
    }

    /// Sets the starting offsets for a brand-new output. `alignment_offset_27mhz`
    /// is clamped to zero before conversion; the PTS side alone carries the
    /// non-zero starting offset so a decoder's buffering margin is preserved.
    pub fn initialize(&mut self, alignment_offset_27mhz: i64) {
        let clamped = alignment_offset_27mhz.max(0) as u64;
        self.state.global_pts_offset = clamped / 300;
        self.state.global_pcr_offset = 0;
    }

    /// Rewrites PCR (if carried) and PTS/DTS (if this is a PES start) in
    /// place, relative to this segment's `pts_base`/`pcr_base`.
    pub fn rebase(&self, packet: &mut TsPacket, pts_base: u64, pcr_base: u64) -> Result<()> {
        if let Some(old_pcr) = packet.pcr() {
            let delta = old_pcr as i128 - pcr_base as i128 + self.state.global_pcr_offset as i128;
            packet.set_pcr(delta.max(0) as u64);
        }

        if !packet.payload_unit_start() {
            return Ok(());
        }
        let Some(payload) = packet.payload_mut() else {
            return Ok(());
        };
        let Ok((header, _)) = PESHeader::parse(payload) else {
            return Ok(());
        };
        if let (Some(old_pts), Some(off)) = (header.pts, header.pts_offset()) {
            let new_pts = rebase_33(old_pts, pts_base, self.state.global_pts_offset);
            let marker = if header.dts.is_some() { 0x30 } else { 0x20 };
            rewrite_timestamp_in_place(payload, off, marker, new_pts)?;
        }
        if let (Some(old_dts), Some(off)) = (header.dts, header.dts_offset()) {
            let new_dts = rebase_33(old_dts, pts_base, self.state.global_pts_offset);
            rewrite_timestamp_in_place(payload, off, 0x10, new_dts)?;
        }
        Ok(())
    }

    /// Overwrites `packet`'s continuity counter with the next value for its
    /// PID, if it carries payload. No-op otherwise (CC only advances on
    /// payload-bearing packets, per spec).
    pub fn fix_continuity(&mut self, packet: &mut TsPacket) {
        if !packet.has_payload() {
            return;
        }
        let counter = self.state.continuity_counters.entry(packet.pid()).or_insert(0);
        packet.set_continuity_counter(*counter);
        *counter = (*counter + 1) & 0x0F;
    }

    /// Synthesizes the canonical PAT as a single TS packet.
    pub fn pat(&mut self) -> Result<TsPacket> {
        let pat = PAT {
            entries: vec![PATEntry {
                program_number: self.program_number,
                network_pid: 0,
                program_map_pid: PID_PMT,
            }],
        };
        let mut section = BytesMut::new();
        section.extend_from_slice(&[TABLE_ID_PAT, 0, 0]); // length patched below
        section.extend_from_slice(&TABLE_EXT_PAT.to_be_bytes());
        section.extend_from_slice(&[0xC1, 0x00, 0x00]);
        pat.write_to(&mut section)?;
        self.finish_psi_packet(section, PID_PAT)
    }

    /// Synthesizes the canonical PMT as a single TS packet.
    pub fn pmt(&mut self, pcr_pid: u16, video_stream_type: u8, has_audio: bool) -> Result<TsPacket> {
        let mut elementary_stream_infos = vec![ElementaryStreamInfo {
            stream_type: video_stream_type,
            elementary_pid: PID_VIDEO,
            descriptors: Vec::<Descriptor>::new(),
        }];
        if has_audio {
            elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type: crate::ts::types::STREAM_TYPE_AAC,
                elementary_pid: PID_AUDIO,
                descriptors: Vec::new(),
            });
        }
        let pmt = PMT {
            pcr_pid,
            program_descriptors: Vec::new(),
            elementary_stream_infos,
        };
        let mut section = BytesMut::new();
        section.extend_from_slice(&[TABLE_ID_PMT, 0, 0]);
        section.extend_from_slice(&self.program_number.to_be_bytes());
        section.extend_from_slice(&[0xC1, 0x00, 0x00]);
        pmt.write_to(&mut section)?;
        self.finish_psi_packet(section, PID_PMT)
    }

    /// Patches in the section length, appends the CRC32, and wraps the
    /// section in a single TS packet with a pointer field of 0.
    fn finish_psi_packet(&mut self, mut section: BytesMut, pid: u16) -> Result<TsPacket> {
        let section_length = section.len() - 3 + 4; // bytes after length field, plus CRC
        section[1] = 0xB0 | ((section_length >> 8) as u8 & 0x0F);
        section[2] = (section_length & 0xFF) as u8;
        let crc = self.crc.calculate(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        let mut raw = BytesMut::with_capacity(TS_PACKET_SIZE);
        let header = TSHeader {
            sync_byte: 0x47,
            transport_error: false,
            payload_unit_start: true,
            transport_priority: false,
            pid,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        };
        header.write_to(&mut raw)?;
        raw.extend_from_slice(&[0x00]); // pointer field
        raw.extend_from_slice(&section);
        raw.resize(TS_PACKET_SIZE, 0xFF);

        let mut packet = TsPacket::from_slice(&raw)?;
        self.fix_continuity(&mut packet);
        Ok(packet)
    }

    /// Synthesizes the PES carrying `sps` then `pps`, fragmented into TS
    /// packets on `video_pid`. PTS-only header; the last packet is padded
    /// with adaptation-field stuffing when short.
    pub fn sps_pps_pes(&mut self, sps: &[u8], pps: &[u8], video_pid: u16, pts: u64) -> Result<Vec<TsPacket>> {
        let mut elementary = BytesMut::new();
        elementary.extend_from_slice(&[0x00, 0x00, 0x01]);
        elementary.extend_from_slice(sps);
        elementary.extend_from_slice(&[0x00, 0x00, 0x01]);
        elementary.extend_from_slice(pps);

        let mut pes = BytesMut::new();
        pes.extend_from_slice(&[0x00, 0x00, 0x01, STREAM_ID_H264]);
        let packet_length = (3 + 5 + elementary.len()).min(0xFFFF) as u16;
        pes.extend_from_slice(&packet_length.to_be_bytes());
        pes.extend_from_slice(&[0x80, 0x00, 0x05]); // flags: PTS-only; flags2: none; header_data_length=5
        crate::ts::pes::write_pts_only(&mut pes, 0x20, pts)?;
        pes.extend_from_slice(&elementary);

        Ok(self.fragment_into_packets(video_pid, true, &pes))
    }

    /// Splits `payload` across as many 188-byte packets as needed, setting
    /// PUSI only on the first and padding the final one with adaptation
    /// field stuffing.
    fn fragment_into_packets(&mut self, pid: u16, pusi_first: bool, payload: &[u8]) -> Vec<TsPacket> {
        const CHUNK: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let chunk_len = remaining.min(CHUNK);
            let chunk = &payload[offset..offset + chunk_len];
            offset += chunk_len;

            let mut raw = BytesMut::with_capacity(TS_PACKET_SIZE);
            let pusi = pusi_first && offset == chunk_len;
            let stuffing = CHUNK - chunk_len;
            let header = TSHeader {
                sync_byte: 0x47,
                transport_error: false,
                payload_unit_start: pusi,
                transport_priority: false,
                pid,
                scrambling_control: 0,
                adaptation_field_exists: stuffing > 0,
                contains_payload: true,
                continuity_counter: 0,
            };
            header.write_to(&mut raw).expect("header write is infallible");
            if stuffing > 0 {
                write_stuffing_adaptation_field(&mut raw, stuffing);
            }
            raw.extend_from_slice(chunk);

            let mut packet = TsPacket::from_slice(&raw).expect("packet is exactly 188 bytes");
            self.fix_continuity(&mut packet);
            packets.push(packet);
        }
        packets
    }

    /// Resets the running offsets to the maximum PTS/PCR actually observed
    /// in the segment just finished, so the next segment's first rebased
    /// value lands immediately after it.
    pub fn advance_offsets(&mut self, max_pts_observed: u64, max_pcr_observed: u64) {
        self.state.global_pts_offset = max_pts_observed;
        self.state.global_pcr_offset = max_pcr_observed;
    }
}

fn rebase_33(old: u64, base: u64, offset: u64) -> u64 {
    let delta = old as i128 - base as i128 + offset as i128;
    delta.rem_euclid(1i128 << 33) as u64
}

/// Writes the adaptation field length byte, a flags byte with no optional
/// fields set, and `stuffing - 2` bytes of 0xFF stuffing.
fn write_stuffing_adaptation_field(buf: &mut BytesMut, stuffing: usize) {
    use bytes::BufMut;
    let af_len = stuffing - 1;
    buf.put_u8(af_len as u8);
    if af_len > 0 {
        buf.put_u8(0x00);
        for _ in 0..af_len.saturating_sub(1) {
            buf.put_u8(0xFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_sets_pts_offset_from_alignment_and_clamps_negative() {
        let mut splicer = Splicer::new(1);
        splicer.initialize(27_000_000); // 1 second of PCR ticks
        assert_eq!(splicer.state().global_pts_offset, 90_000);
        assert_eq!(splicer.state().global_pcr_offset, 0);

        splicer.initialize(-5);
        assert_eq!(splicer.state().global_pts_offset, 0);
    }

    #[test]
    fn fix_continuity_increments_per_pid_and_wraps_mod_16() {
        let mut splicer = Splicer::new(1);
        let mut raw = [0xFFu8; TS_PACKET_SIZE];
        raw[0] = 0x47;
        raw[1] = 0x01;
        raw[2] = 0x00;
        raw[3] = 0x10;
        let mut packet = TsPacket::from_slice(&raw).unwrap();
        for expected in 0..20u8 {
            splicer.fix_continuity(&mut packet);
            assert_eq!(packet.continuity_counter(), expected % 16);
        }
    }

    #[test]
    fn pat_and_pmt_are_well_formed_single_packets() {
        let mut splicer = Splicer::new(1);
        let pat = splicer.pat().unwrap();
        assert_eq!(pat.pid(), PID_PAT);
        assert!(pat.payload_unit_start());

        let pmt = splicer.pmt(PID_VIDEO, crate::ts::types::STREAM_TYPE_H264, true).unwrap();
        assert_eq!(pmt.pid(), PID_PMT);
    }

    #[test]
    fn sps_pps_pes_starts_with_pusi_and_fits_in_one_packet_for_small_input() {
        let mut splicer = Splicer::new(1);
        let packets = splicer
            .sps_pps_pes(&[0x67, 0x42, 0x00, 0x1E], &[0x68, 0xCE], PID_VIDEO, 0)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload_unit_start());
        assert_eq!(packets[0].pid(), PID_VIDEO);
    }

    #[test]
    fn rebase_33_wraps_at_boundary() {
        let near_max = 0x1_FFFF_FFFF - 10;
        let rebased = rebase_33(near_max, 0, 20);
        assert_eq!(rebased, 9);
    }

    #[test]
    fn sps_pps_pes_is_deterministic_byte_for_byte() {
        // pretty_assertions gives a readable diff if fragmentation ever
        // drifts between two otherwise-identical synthesis calls.
        use pretty_assertions::assert_eq as passert_eq;
        let sps = [0x67, 0x42, 0x00, 0x1E];
        let pps = [0x68, 0xCE];
        let mut a = Splicer::new(7);
        let mut b = Splicer::new(7);
        let packets_a = a.sps_pps_pes(&sps, &pps, PID_VIDEO, 12345).unwrap();
        let packets_b = b.sps_pps_pes(&sps, &pps, PID_VIDEO, 12345).unwrap();
        passert_eq!(packets_a.len(), packets_b.len());
        for (pa, pb) in packets_a.iter().zip(packets_b.iter()) {
            passert_eq!(pa.as_bytes(), pb.as_bytes());
        }
    }

    // 33-bit PTS wrap masking: the rebased value must always be a valid
    // 33-bit timestamp, for any old/base/offset combination.
    #[quickcheck_macros::quickcheck]
    fn rebase_33_output_always_fits_in_33_bits(old: u64, base: u64, offset: u64) -> bool {
        const MASK33: u64 = (1u64 << 33) - 1;
        rebase_33(old & MASK33, base & MASK33, offset & MASK33) <= MASK33
    }

    // Continuity-counter sequencing: regardless of which PID or how many
    // packets pass through, the counter for that PID walks 0..=15 in order
    // and wraps without skipping.
    #[quickcheck_macros::quickcheck]
    fn fix_continuity_sequences_mod_16(pid: u16, packet_count: u8) -> bool {
        let mut splicer = Splicer::new(1);
        let pid = pid & 0x1FFF;
        let mut raw = [0xFFu8; TS_PACKET_SIZE];
        raw[0] = 0x47;
        raw[1] = (pid >> 8) as u8 & 0x1F;
        raw[2] = (pid & 0xFF) as u8;
        raw[3] = 0x10;
        let mut packet = TsPacket::from_slice(&raw).unwrap();
        let mut expected = 0u8;
        for _ in 0..=packet_count {
            splicer.fix_continuity(&mut packet);
            if packet.continuity_counter() != expected {
                return false;
            }
            expected = (expected + 1) & 0x0F;
        }
        true
    }
}
