//! Folds a sequence of TS packets into a [`StreamInfo`] snapshot by tracking
//! the PAT and the PMT it points to.
//!
//! Sections are assumed to fit in a single TS packet, which holds for every
//! PAT/PMT this crate has been asked to splice; a section spanning multiple
//! packets is reported as a parse error rather than silently mis-assembled.

use crate::error::{Result, SpliceError};
use crate::ts::parser::TSPacketParser;
use crate::ts::types::{
    STREAM_TYPE_AAC, STREAM_TYPE_AC3, STREAM_TYPE_H264, STREAM_TYPE_H265, STREAM_TYPE_MPEG_AUDIO,
    PID_PAT, TS_HEADER_SIZE,
};
use crate::ts::types::TsPacket;

/// Everything downstream components need to know about a program: where its
/// tables live and which PIDs carry audio and video.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub program_number: u16,
    pub pmt_pid: Option<u16>,
    pub pcr_pid: Option<u16>,
    pub video_pid: Option<u16>,
    pub video_stream_type: Option<u8>,
    pub audio_pid: Option<u16>,
    pub audio_stream_type: Option<u8>,
}

impl StreamInfo {
    /// A `StreamInfo` is usable once it names both a video PID and a PMT.
    pub fn is_initialized(&self) -> bool {
        self.pmt_pid.is_some() && self.video_pid.is_some()
    }
}

/// Folding visitor: feed it packets, read back the accumulated `StreamInfo`.
#[derive(Debug)]
pub struct StreamProbe {
    parser: TSPacketParser,
    info: StreamInfo,
}

impl StreamProbe {
    pub fn new() -> Self {
        Self {
            parser: TSPacketParser::new(),
            info: StreamInfo::default(),
        }
    }

    /// Current snapshot, whether or not it is complete yet.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Feeds one packet. Errors only on a malformed PAT/PMT section; an
    /// unrelated PID is simply ignored.
    pub fn observe(&mut self, packet: &TsPacket) -> Result<()> {
        if !packet.has_payload() || !packet.payload_unit_start() {
            return Ok(());
        }
        let raw = packet.as_bytes();

        if packet.pid() == PID_PAT {
            let table_offset = TS_HEADER_SIZE + raw[TS_HEADER_SIZE] as usize + 1;
            let pat = self.parser.parse_pat(&raw[table_offset..], 0, 0)?;
            if let Some(entry) = pat.entries.iter().find(|e| e.program_number != 0) {
                self.info.program_number = entry.program_number;
                self.info.pmt_pid = Some(entry.program_map_pid);
            }
            return Ok(());
        }

        if Some(packet.pid()) == self.info.pmt_pid {
            let table_offset = TS_HEADER_SIZE + raw[TS_HEADER_SIZE] as usize + 1;
            let pmt = self.parser.parse_pmt(&raw[table_offset..], 0, 0)?;
            self.info.pcr_pid = Some(pmt.pcr_pid);
            for es in &pmt.elementary_stream_infos {
                match es.stream_type {
                    STREAM_TYPE_H264 | STREAM_TYPE_H265 => {
                        self.info.video_pid = Some(es.elementary_pid);
                        self.info.video_stream_type = Some(es.stream_type);
                    }
                    STREAM_TYPE_AAC | STREAM_TYPE_MPEG_AUDIO | STREAM_TYPE_AC3 => {
                        self.info.audio_pid = Some(es.elementary_pid);
                        self.info.audio_stream_type = Some(es.stream_type);
                    }
                    _ => {}
                }
            }
            if self.info.video_pid.is_none() {
                return Err(SpliceError::Psi(
                    "PMT carries no recognized video stream".into(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for StreamProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Crc32Mpeg2;

    fn pat_packet() -> TsPacket {
        let mut raw = [0xFFu8; 188];
        raw[0] = 0x47;
        raw[1] = 0x40;
        raw[2] = 0x00;
        raw[3] = 0x10;
        raw[4] = 0x00; // pointer field
        raw[5] = 0x00; // table id
        raw[6] = 0xB0;
        raw[7] = 0x0D;
        raw[8] = 0x00;
        raw[9] = 0x01;
        raw[10] = 0xC1;
        raw[11] = 0x00;
        raw[12] = 0x00;
        raw[13] = 0x00;
        raw[14] = 0x01;
        raw[15] = 0xF0;
        raw[16] = 0x00; // PMT PID = 0x1000
        let crc = Crc32Mpeg2::new().calculate(&raw[5..17]);
        raw[17..21].copy_from_slice(&crc.to_be_bytes());
        TsPacket::from_slice(&raw).unwrap()
    }

    fn pmt_packet() -> TsPacket {
        let mut raw = [0xFFu8; 188];
        raw[0] = 0x47;
        raw[1] = 0x50; // PUSI + PID high bits (0x1000 >> 8 = 0x10, masked to 0x1F -> 0x10)
        raw[2] = 0x00;
        raw[3] = 0x10;
        raw[4] = 0x00;
        raw[5] = 0x02; // table id PMT
        raw[6] = 0xB0;
        raw[7] = 0x12;
        raw[8] = 0x00;
        raw[9] = 0x01;
        raw[10] = 0xC1;
        raw[11] = 0x00;
        raw[12] = 0x00;
        raw[13] = 0xE1;
        raw[14] = 0x00; // PCR PID 0x100
        raw[15] = 0xF0;
        raw[16] = 0x00; // program info length 0
        raw[17] = STREAM_TYPE_H264;
        raw[18] = 0xE1;
        raw[19] = 0x00; // elementary PID 0x100
        raw[20] = 0xF0;
        raw[21] = 0x00;
        let crc = Crc32Mpeg2::new().calculate(&raw[5..22]);
        raw[22..26].copy_from_slice(&crc.to_be_bytes());
        TsPacket::from_slice(&raw).unwrap()
    }

    #[test]
    fn accumulates_pat_then_pmt_into_stream_info() {
        let mut probe = StreamProbe::new();
        probe.observe(&pat_packet()).unwrap();
        assert!(!probe.info().is_initialized());
        assert_eq!(probe.info().pmt_pid, Some(0x1000));

        probe.observe(&pmt_packet()).unwrap();
        assert!(probe.info().is_initialized());
        assert_eq!(probe.info().video_pid, Some(0x100));
        assert_eq!(probe.info().pcr_pid, Some(0x100));
    }

    #[test]
    fn ignores_unrelated_pids() {
        let mut probe = StreamProbe::new();
        let mut raw = [0xFFu8; 188];
        raw[0] = 0x47;
        raw[1] = 0x41; // PUSI, PID 0x100
        raw[2] = 0x00;
        raw[3] = 0x10;
        let packet = TsPacket::from_slice(&raw).unwrap();
        probe.observe(&packet).unwrap();
        assert!(probe.info().pmt_pid.is_none());
    }
}
