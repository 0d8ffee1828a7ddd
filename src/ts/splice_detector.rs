//! Finds the first safe cut point in a source's video/audio PES streams.
//!
//! A safe cut starts on an IDR (so the decoder needs no prior reference
//! frame) and, when the source carries audio, on or after the first audio
//! PES that follows it (so the two elementary streams start close
//! together). [`SpliceDetector`] accumulates PES payloads per PID from a
//! sequence of packets and reports the result as a [`SpliceAnchor`].

use crate::ts::types::TsPacket;

/// Everything the Splicer needs to begin a source's output from a clean cut.
///
/// `pts_base`, `pcr_base` and `pcr_pts_alignment_offset` are left unset by
/// the detector itself — they're filled in from the rolling-buffer snapshot
/// once the anchor is consumed, since they require looking at the actual
/// PES timestamps rather than just NAL boundaries.
#[derive(Debug, Clone, Default)]
pub struct SpliceAnchor {
    pub idr_index: usize,
    pub audio_sync_index: usize,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub pts_base: Option<u64>,
    pub pcr_base: Option<u64>,
    pub pcr_pts_alignment_offset: Option<i64>,
}

#[derive(Debug, Default)]
struct PesAccumulator {
    buf: Vec<u8>,
    start_index: Option<usize>,
}

impl PesAccumulator {
    /// Feeds one packet's payload. Returns the previous PES (and the index
    /// it started at) whenever a PUSI closes it out.
    fn push(&mut self, payload: &[u8], pusi: bool, index: usize) -> Option<(Vec<u8>, usize)> {
        let mut closed = None;
        if pusi {
            if let Some(start) = self.start_index {
                closed = Some((std::mem::take(&mut self.buf), start));
            }
            self.start_index = Some(index);
        }
        if self.start_index.is_some() {
            self.buf.extend_from_slice(payload);
        }
        closed
    }
}

/// Scans NAL unit start codes out of a PES payload, invoking `on_nal` with
/// `(nal_type, nal_bytes)` for each one found. `nal_bytes` includes the NAL
/// header and excludes the start code.
fn for_each_nal<'a>(pes_payload: &'a [u8], mut on_nal: impl FnMut(u8, &'a [u8])) {
    // (code_start, payload_start) for each start code found, in order.
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= pes_payload.len() {
        if pes_payload[i] == 0 && pes_payload[i + 1] == 0 {
            if pes_payload[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 4 <= pes_payload.len() && pes_payload[i + 2] == 0 && pes_payload[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    for (n, &(_, payload_start)) in starts.iter().enumerate() {
        if payload_start >= pes_payload.len() {
            continue;
        }
        let end = starts
            .get(n + 1)
            .map(|&(code_start, _)| code_start)
            .unwrap_or(pes_payload.len());
        if end <= payload_start {
            continue;
        }
        let nal = &pes_payload[payload_start..end];
        on_nal(nal[0] & 0x1F, nal);
    }
}

/// Accumulates video/audio PES boundaries and reports the first complete
/// splice anchor.
#[derive(Debug)]
pub struct SpliceDetector {
    video_pid: u16,
    audio_pid: Option<u16>,
    video_acc: PesAccumulator,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    latest_idr_index: Option<usize>,
    audio_sync_index: Option<usize>,
    pinned: Option<SpliceAnchor>,
}

impl SpliceDetector {
    pub fn new(video_pid: u16, audio_pid: Option<u16>) -> Self {
        Self {
            video_pid,
            audio_pid,
            video_acc: PesAccumulator::default(),
            sps: None,
            pps: None,
            latest_idr_index: None,
            audio_sync_index: None,
            pinned: None,
        }
    }

    /// The most recent IDR seen, pinned or not — used by the Orchestrator to
    /// re-cut mid-stream without waiting for a fresh connection.
    pub fn latest_idr_index(&self) -> Option<usize> {
        self.latest_idr_index
    }

    /// The first completed anchor, once one exists.
    pub fn anchor(&self) -> Option<&SpliceAnchor> {
        self.pinned.as_ref()
    }

    /// Unpins the current anchor so the next IDR (with its own audio sync)
    /// becomes the new splice point. Used when a loop restarts or a source
    /// reconnects.
    pub fn reset(&mut self) {
        self.pinned = None;
        self.audio_sync_index = None;
        self.latest_idr_index = None;
    }

    /// Feeds one packet at its position in the rolling buffer.
    pub fn observe(&mut self, packet: &TsPacket, index: usize) {
        if packet.pid() == self.video_pid {
            self.observe_video(packet, index);
        } else if Some(packet.pid()) == self.audio_pid {
            self.observe_audio(packet, index);
        }
        self.try_pin();
    }

    fn observe_video(&mut self, packet: &TsPacket, index: usize) {
        let Some(payload) = packet.payload() else {
            return;
        };
        let closed = self
            .video_acc
            .push(payload, packet.payload_unit_start(), index);
        let Some((pes, start)) = closed else {
            return;
        };
        self.scan_video_pes(&pes, start);
    }

    fn scan_video_pes(&mut self, pes: &[u8], start_index: usize) {
        // Skip the PES header: the elementary stream starts after it, but a
        // raw byte scan for NAL start codes is safe to run over the whole
        // PES since `00 00 01`/`00 00 00 01` cannot appear inside a PES
        // header's fixed fields by construction.
        let mut saw_idr = false;
        for_each_nal(pes, |nal_type, nal| match nal_type {
            5 => saw_idr = true,
            7 => {
                if self.sps.is_none() {
                    self.sps = Some(nal.to_vec());
                }
            }
            8 => {
                if self.pps.is_none() {
                    self.pps = Some(nal.to_vec());
                }
            }
            _ => {}
        });
        if saw_idr {
            self.latest_idr_index = Some(start_index);
        }
    }

    fn observe_audio(&mut self, packet: &TsPacket, index: usize) {
        if self.audio_sync_index.is_some() {
            return;
        }
        if !packet.payload_unit_start() {
            return;
        }
        if let Some(idr) = self.latest_idr_index {
            if index >= idr {
                self.audio_sync_index = Some(index);
            }
        }
    }

    fn try_pin(&mut self) {
        if self.pinned.is_some() {
            return;
        }
        let Some(idr_index) = self.latest_idr_index else {
            return;
        };
        let audio_ready = match self.audio_pid {
            None => true,
            Some(_) => self.audio_sync_index.is_some(),
        };
        if !audio_ready {
            return;
        }
        let Some(sps) = &self.sps else {
            return;
        };
        let Some(pps) = &self.pps else {
            return;
        };
        let audio_sync_index = self.audio_sync_index.unwrap_or(idr_index);
        self.pinned = Some(SpliceAnchor {
            idr_index,
            audio_sync_index,
            sps: sps.clone(),
            pps: pps.clone(),
            pts_base: None,
            pcr_base: None,
            pcr_pts_alignment_offset: None,
        });
    }

    /// Degrades a pending anchor to audio-less readiness once a
    /// `wait_for_audio_sync` timeout elapses: pins using `idr_index` as the
    /// audio sync point even though the source does carry audio.
    pub fn force_audio_sync_to_idr(&mut self) {
        if self.audio_sync_index.is_none() {
            if let Some(idr) = self.latest_idr_index {
                self.audio_sync_index = Some(idr);
                self.try_pin();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::types::{TS_HEADER_SIZE, TS_PACKET_SIZE};

    fn video_packet(pid: u16, pusi: bool, payload: &[u8], index_hint: u8) -> TsPacket {
        let mut raw = vec![0u8; TS_PACKET_SIZE];
        raw[0] = 0x47;
        raw[1] = if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
        raw[2] = (pid & 0xFF) as u8;
        raw[3] = 0x10 | (index_hint & 0x0F);
        let n = payload.len().min(TS_PACKET_SIZE - TS_HEADER_SIZE);
        raw[TS_HEADER_SIZE..TS_HEADER_SIZE + n].copy_from_slice(&payload[..n]);
        TsPacket::from_slice(&raw).unwrap()
    }

    fn pes_with_idr_sps_pps() -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E]); // SPS
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0x68, 0xCE]); // PPS
        pes.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0xAA, 0xBB]); // IDR slice
        pes
    }

    #[test]
    fn pins_anchor_once_idr_and_audio_sync_both_seen() {
        let mut detector = SpliceDetector::new(0x100, Some(0x101));
        let pes = pes_with_idr_sps_pps();

        detector.observe(&video_packet(0x100, true, &pes, 0), 0);
        // PUSI-close requires the *next* video PUSI; feed a trailing one.
        detector.observe(&video_packet(0x100, true, &[], 1), 1);
        assert!(detector.anchor().is_none());

        let mut audio_raw = vec![0u8; TS_PACKET_SIZE];
        audio_raw[0] = 0x47;
        audio_raw[1] = 0x40 | ((0x101u16 >> 8) as u8 & 0x1F);
        audio_raw[2] = 0x01;
        audio_raw[3] = 0x10;
        let audio_packet = TsPacket::from_slice(&audio_raw).unwrap();
        detector.observe(&audio_packet, 2);

        let anchor = detector.anchor().expect("anchor should be pinned");
        assert_eq!(anchor.idr_index, 0);
        assert_eq!(anchor.audio_sync_index, 2);
        assert_eq!(anchor.sps, vec![0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(anchor.pps, vec![0x68, 0xCE]);
    }

    #[test]
    fn audio_less_source_pins_on_idr_alone() {
        let mut detector = SpliceDetector::new(0x100, None);
        let pes = pes_with_idr_sps_pps();
        detector.observe(&video_packet(0x100, true, &pes, 0), 0);
        detector.observe(&video_packet(0x100, true, &[], 1), 1);

        let anchor = detector.anchor().expect("anchor should be pinned");
        assert_eq!(anchor.idr_index, 0);
        assert_eq!(anchor.audio_sync_index, 0);
    }

    #[test]
    fn reset_requires_a_fresh_idr_before_repinning() {
        let mut detector = SpliceDetector::new(0x100, None);
        let pes = pes_with_idr_sps_pps();
        detector.observe(&video_packet(0x100, true, &pes, 0), 0);
        detector.observe(&video_packet(0x100, true, &[], 1), 1);
        assert!(detector.anchor().is_some());

        detector.reset();
        assert!(detector.anchor().is_none());

        detector.observe(&video_packet(0x100, true, &pes, 2), 2);
        detector.observe(&video_packet(0x100, true, &[], 3), 3);
        assert!(detector.anchor().is_some());
        assert_eq!(detector.anchor().unwrap().idr_index, 2);
    }
}
