//! Optional output-side diagnostic tap.
//!
//! Grounded on the reference implementation's `OutputTimestampMonitor`: it
//! never mutates a packet or feeds back into a splicing decision, it only
//! tracks per-PID PCR/PTS/DTS monotonicity and counts discontinuities for
//! logging. The orchestrator wires it in after `Splicer::rebase` and before
//! `Sink::write`, optionally.

use crate::ts::pes::PESHeader;
use crate::ts::types::TsPacket;

/// 33-bit timestamp space; values wrap at this boundary.
const MAX_TIMESTAMP_33BIT: u64 = (1 << 33) - 1;
/// Allowed backward PTS jump for video B-frame reordering, in 90 kHz ticks
/// (~6 frames at 30 fps).
const MAX_BACKWARD_VIDEO_PTS: i64 = 16_200;

#[derive(Debug, Default)]
struct PidTimestampState {
    last_pts: Option<u64>,
    last_dts: Option<u64>,
}

/// Discontinuity counts accumulated since the last [`Monitor::reset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscontinuityStats {
    pub video_pts_discontinuities: u64,
    pub video_dts_discontinuities: u64,
    pub audio_pts_discontinuities: u64,
    pub audio_dts_discontinuities: u64,
    pub pcr_discontinuities: u64,
    pub total_video_packets: u64,
    pub total_audio_packets: u64,
    pub total_pcr_packets: u64,
}

/// Tracks output timestamp monotonicity for diagnostics. Read-only with
/// respect to the packets it observes.
#[derive(Debug, Default)]
pub struct Monitor {
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    video: PidTimestampState,
    audio: PidTimestampState,
    last_pcr: Option<u64>,
    stats: DiscontinuityStats,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_video_pid(&mut self, pid: u16) {
        self.video_pid = Some(pid);
    }

    pub fn set_audio_pid(&mut self, pid: u16) {
        self.audio_pid = Some(pid);
    }

    pub fn stats(&self) -> DiscontinuityStats {
        self.stats
    }

    pub fn reset(&mut self) {
        *self = Monitor {
            video_pid: self.video_pid,
            audio_pid: self.audio_pid,
            ..Monitor::default()
        };
    }

    /// Inspects one already-rebased output packet. Returns `false` if any
    /// discontinuity was observed and logged.
    pub fn observe(&mut self, packet: &TsPacket) -> bool {
        let mut ok = true;

        if let Some(pcr) = packet.pcr() {
            self.stats.total_pcr_packets += 1;
            ok &= self.check_pcr(pcr);
        }

        if Some(packet.pid()) == self.video_pid {
            self.stats.total_video_packets += 1;
            if let Some((pts, dts)) = extract_pts_dts(packet) {
                if let Some(dts) = dts {
                    ok &= self.check_video_dts(dts);
                }
                if let Some(pts) = pts {
                    ok &= self.check_video_pts(pts);
                }
            }
        } else if Some(packet.pid()) == self.audio_pid {
            self.stats.total_audio_packets += 1;
            if let Some((pts, dts)) = extract_pts_dts(packet) {
                if let Some(dts) = dts {
                    ok &= self.check_audio_dts(dts);
                } else if let Some(pts) = pts {
                    // Audio typically carries no DTS; PTS doubles as it.
                    ok &= self.check_audio_dts(pts);
                }
                if let Some(pts) = pts {
                    ok &= self.check_audio_pts(pts);
                }
            }
        }

        ok
    }

    fn check_pcr(&mut self, current: u64) -> bool {
        let Some(prev) = self.last_pcr.replace(current) else {
            return true;
        };
        if is_timestamp_increasing(prev, current) {
            true
        } else {
            self.stats.pcr_discontinuities += 1;
            log::warn!(
                "pcr discontinuity: previous={prev} current={current} delta={}",
                current as i64 - prev as i64
            );
            false
        }
    }

    fn check_video_dts(&mut self, current: u64) -> bool {
        let Some(prev) = self.video.last_dts.replace(current) else {
            return true;
        };
        if is_timestamp_increasing(prev, current) {
            true
        } else {
            self.stats.video_dts_discontinuities += 1;
            log::warn!("video dts not increasing: previous={prev} current={current}");
            false
        }
    }

    fn check_video_pts(&mut self, current: u64) -> bool {
        let Some(prev) = self.video.last_pts.replace(current) else {
            return true;
        };
        let delta = current as i64 - prev as i64;
        if delta < -MAX_BACKWARD_VIDEO_PTS && !is_timestamp_increasing(prev, current) {
            self.stats.video_pts_discontinuities += 1;
            log::warn!("video pts large backward jump: previous={prev} current={current} delta={delta}");
            false
        } else {
            true
        }
    }

    fn check_audio_dts(&mut self, current: u64) -> bool {
        let Some(prev) = self.audio.last_dts.replace(current) else {
            return true;
        };
        if is_timestamp_increasing(prev, current) {
            true
        } else {
            self.stats.audio_dts_discontinuities += 1;
            log::warn!("audio dts not increasing: previous={prev} current={current}");
            false
        }
    }

    fn check_audio_pts(&mut self, current: u64) -> bool {
        let Some(prev) = self.audio.last_pts.replace(current) else {
            return true;
        };
        if is_timestamp_increasing(prev, current) {
            true
        } else {
            self.stats.audio_pts_discontinuities += 1;
            log::warn!("audio pts not increasing: previous={prev} current={current}");
            false
        }
    }
}

/// Strictly-increasing check over the 33-bit timestamp space, tolerant of
/// one wraparound (current near zero, previous near the max).
fn is_timestamp_increasing(prev: u64, current: u64) -> bool {
    if current > prev {
        return true;
    }
    let distance_to_max = MAX_TIMESTAMP_33BIT - prev;
    distance_to_max < MAX_TIMESTAMP_33BIT / 4 && current < MAX_TIMESTAMP_33BIT / 4
}

fn extract_pts_dts(packet: &TsPacket) -> Option<(Option<u64>, Option<u64>)> {
    if !packet.payload_unit_start() {
        return None;
    }
    let payload = packet.payload()?;
    let (header, _) = PESHeader::parse(payload).ok()?;
    Some((header.pts, header.dts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_non_increasing_pcr() {
        let mut monitor = Monitor::new();
        assert!(monitor.check_pcr(1000));
        assert!(monitor.check_pcr(2000));
        assert!(!monitor.check_pcr(1500));
        assert_eq!(monitor.stats().pcr_discontinuities, 1);
    }

    #[test]
    fn tolerates_pcr_wraparound() {
        let mut monitor = Monitor::new();
        assert!(monitor.check_pcr(MAX_TIMESTAMP_33BIT - 10));
        assert!(monitor.check_pcr(5));
        assert_eq!(monitor.stats().pcr_discontinuities, 0);
    }

    #[test]
    fn allows_small_video_pts_backward_jump_but_not_large() {
        let mut monitor = Monitor::new();
        assert!(monitor.check_video_pts(100_000));
        assert!(monitor.check_video_pts(99_000));
        assert!(!monitor.check_video_pts(50_000));
        assert_eq!(monitor.stats().video_pts_discontinuities, 1);
    }

    #[test]
    fn audio_pts_must_be_strictly_increasing() {
        let mut monitor = Monitor::new();
        assert!(monitor.check_audio_pts(100));
        assert!(!monitor.check_audio_pts(99));
        assert_eq!(monitor.stats().audio_pts_discontinuities, 1);
    }
}
