//! Per-ingress background producer: reads bytes, reassembles packets,
//! folds PAT/PMT, scans for a splice anchor, and exposes the result to the
//! orchestrator thread through a bounded rolling buffer.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SpliceError};
use crate::ts::probe::{StreamInfo, StreamProbe};
use crate::ts::reassembler::Reassembler;
use crate::ts::splice_detector::{SpliceAnchor, SpliceDetector};
use crate::ts::types::TsPacket;

/// Bounded ordered sequence of packets backing one source's replay state.
///
/// Every index into it (`last_snapshot_end`, `consume_index`) is relative to
/// the current head; [`trim_front`](Self::trim_front) keeps them coherent
/// whenever old packets are dropped.
#[derive(Debug, Default)]
pub struct RollingBuffer {
    packets: Vec<TsPacket>,
    consume_index: usize,
    last_snapshot_end: usize,
}

impl RollingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: TsPacket) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Drops `count` packets from the head, shifting every stored index
    /// down by the same amount (clamped to zero, never negative).
    fn trim_front(&mut self, count: usize, anchor: &mut Option<SpliceAnchor>) {
        let count = count.min(self.packets.len());
        if count == 0 {
            return;
        }
        self.packets.drain(0..count);
        self.consume_index = self.consume_index.saturating_sub(count);
        self.last_snapshot_end = self.last_snapshot_end.saturating_sub(count);
        if let Some(a) = anchor {
            a.idr_index = a.idr_index.saturating_sub(count);
            a.audio_sync_index = a.audio_sync_index.saturating_sub(count);
        }
    }

    /// Packets from `start` to the current tail.
    pub fn slice_from(&self, start: usize) -> &[TsPacket] {
        if start >= self.packets.len() {
            &[]
        } else {
            &self.packets[start..]
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    buffer: RollingBuffer,
    probe: StreamProbe,
    detector: Option<SpliceDetector>,
    anchor: Option<SpliceAnchor>,
    reassembler_stats_discarded: u64,
    video_pes_with_ts_count: u32,
    audio_pusi_count: u32,
}

/// Readiness flags inspectable without taking the mutex; authoritative
/// transitions still happen under the lock and notify the condition
/// variable so blocking waiters wake promptly.
#[derive(Debug, Default)]
struct Flags {
    connected: AtomicBool,
    stream_info_ready: AtomicBool,
    idr_ready: AtomicBool,
    audio_ready: AtomicBool,
    stop: AtomicBool,
}

/// Background ingestion and analysis for one ingress (a camera feed, a
/// fallback loop, a file).
pub struct SourceBuffer {
    shared: Arc<Mutex<Shared>>,
    cv: Arc<Condvar>,
    flags: Arc<Flags>,
    bound: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SourceBuffer {
    /// `bound` caps the rolling buffer's length once an anchor has been
    /// pinned (see `RollingBuffer` docs for why it's unbounded before then).
    pub fn new(bound: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            cv: Arc::new(Condvar::new()),
            flags: Arc::new(Flags::default()),
            bound,
            worker: Mutex::new(None),
        })
    }

    pub fn connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    /// Non-blocking readiness check: an anchor is pinned and audio sync has
    /// resolved (or degraded). Used by the orchestrator to probe an inactive
    /// source without blocking on its condition variable.
    pub fn is_ready(&self) -> bool {
        self.flags.idr_ready.load(Ordering::Acquire) && self.flags.audio_ready.load(Ordering::Acquire)
    }

    /// Counts behind the media-validity floor (OQ-1): video PES with a
    /// parsed PTS, and audio PUSI packets, seen since the last reconnect.
    pub fn media_health_counts(&self) -> (u32, u32) {
        let shared = self.shared.lock();
        (shared.video_pes_with_ts_count, shared.audio_pusi_count)
    }

    /// Non-blocking peek at the discovered `StreamInfo`, if any.
    pub fn try_stream_info(&self) -> Option<StreamInfo> {
        if self.flags.stream_info_ready.load(Ordering::Acquire) {
            Some(self.shared.lock().probe.info().clone())
        } else {
            None
        }
    }

    /// Starts the background producer thread, reading from `ingress` (a
    /// factory so the thread can reconnect after an I/O error) and feeding
    /// the reassembler/probe/detector pipeline.
    pub fn start<F, R>(self: &Arc<Self>, mut ingress: F, reassembler_max_buffer: usize, verify_count: usize)
    where
        F: FnMut() -> std::io::Result<R> + Send + 'static,
        R: Read,
    {
        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            let backoff = crate::config::current().reconnect_backoff_ms;
            let mut reassembler = Reassembler::with_verify_count(reassembler_max_buffer, verify_count);
            'reconnect: while !this.flags.stop.load(Ordering::Acquire) {
                let mut conn = match ingress() {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("source ingress connect failed: {e}");
                        std::thread::sleep(Duration::from_millis(backoff));
                        continue 'reconnect;
                    }
                };
                this.flags.connected.store(true, Ordering::Release);
                let mut buf = [0u8; 4096];
                loop {
                    if this.flags.stop.load(Ordering::Acquire) {
                        break 'reconnect;
                    }
                    match conn.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            reassembler.push_bytes(&buf[..n]);
                            this.ingest(reassembler.drain_packets());
                        }
                        Err(e) => {
                            log::warn!("source ingress read failed: {e}");
                            break;
                        }
                    }
                }
                this.reset_for_disconnect();
                std::thread::sleep(Duration::from_millis(backoff));
            }
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.flags.stop.store(true, Ordering::Release);
        self.cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn reset_for_disconnect(&self) {
        self.flags.connected.store(false, Ordering::Release);
        self.flags.stream_info_ready.store(false, Ordering::Release);
        self.flags.idr_ready.store(false, Ordering::Release);
        self.flags.audio_ready.store(false, Ordering::Release);
        let mut shared = self.shared.lock();
        *shared = Shared::default();
        self.cv.notify_all();
    }

    fn ingest(&self, packets: Vec<TsPacket>) {
        if packets.is_empty() {
            return;
        }
        let mut shared = self.shared.lock();
        for packet in packets {
            let index = shared.buffer.len();
            if let Err(e) = shared.probe.observe(&packet) {
                log::warn!("PSI parse error: {e}");
            }
            if shared.detector.is_none() && shared.probe.info().is_initialized() {
                let info = shared.probe.info().clone();
                shared.detector = Some(SpliceDetector::new(
                    info.video_pid.expect("initialized implies video_pid"),
                    info.audio_pid,
                ));
                self.flags.stream_info_ready.store(true, Ordering::Release);
            }
            if let Some(detector) = shared.detector.as_mut() {
                detector.observe(&packet, index);
            }
            if let Some(info) = shared.detector.is_some().then(|| shared.probe.info().clone()) {
                if packet.payload_unit_start() {
                    if Some(packet.pid()) == info.video_pid {
                        if let Some(payload) = packet.payload() {
                            if crate::ts::pes::PESHeader::parse(payload)
                                .ok()
                                .and_then(|(h, _)| h.pts)
                                .is_some()
                            {
                                shared.video_pes_with_ts_count += 1;
                            }
                        }
                    } else if Some(packet.pid()) == info.audio_pid {
                        shared.audio_pusi_count += 1;
                    }
                }
            }
            shared.buffer.push(packet);
        }
        if shared.anchor.is_none() {
            let anchor = shared.detector.as_ref().and_then(|detector| detector.anchor().cloned());
            if let Some(anchor) = anchor {
                shared.anchor = Some(anchor.clone());
                self.flags.idr_ready.store(true, Ordering::Release);
                if shared.probe.info().audio_pid.is_none()
                    || anchor.audio_sync_index != anchor.idr_index
                {
                    self.flags.audio_ready.store(true, Ordering::Release);
                }
            }
        }
        self.trim_if_needed(&mut shared);
        drop(shared);
        self.cv.notify_all();
    }

    fn trim_if_needed(&self, shared: &mut Shared) {
        if shared.anchor.is_none() {
            return;
        }
        if shared.buffer.len() <= self.bound && shared.buffer.consume_index <= self.bound / 2 {
            return;
        }
        let excess = shared.buffer.len().saturating_sub(self.bound);
        let compaction = shared.buffer.consume_index.min(shared.buffer.len());
        let drop_count = excess.max(compaction);
        shared.buffer.trim_front(drop_count, &mut shared.anchor);
    }

    /// Blocks until [`StreamProbe`] has yielded an initialized `StreamInfo`.
    pub fn wait_for_stream_info(&self) -> Result<StreamInfo> {
        let mut shared = self.shared.lock();
        while !self.flags.stream_info_ready.load(Ordering::Acquire) {
            if self.flags.stop.load(Ordering::Acquire) {
                return Err(SpliceError::NotReady("source stopped".into()));
            }
            self.cv.wait(&mut shared);
        }
        Ok(shared.probe.info().clone())
    }

    /// Blocks until the splice detector pins its initial anchor.
    pub fn wait_for_idr(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        while !self.flags.idr_ready.load(Ordering::Acquire) {
            if self.flags.stop.load(Ordering::Acquire) {
                return Err(SpliceError::NotReady("source stopped".into()));
            }
            self.cv.wait(&mut shared);
        }
        Ok(())
    }

    /// Blocks until the anchor's audio sync is set, or `timeout` elapses —
    /// at which point the anchor degrades to `audio_sync_index = idr_index`
    /// and this returns `Ok` anyway.
    pub fn wait_for_audio_sync(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        while !self.flags.audio_ready.load(Ordering::Acquire) {
            if self.flags.stop.load(Ordering::Acquire) {
                return Err(SpliceError::NotReady("source stopped".into()));
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(detector) = shared.detector.as_mut() {
                    detector.force_audio_sync_to_idr();
                    if let Some(anchor) = detector.anchor() {
                        shared.anchor = Some(anchor.clone());
                    }
                }
                self.flags.audio_ready.store(true, Ordering::Release);
                break;
            }
            let timed_out = self.cv.wait_for(&mut shared, deadline - now).timed_out();
            if timed_out {
                continue;
            }
        }
        Ok(())
    }

    /// Unpins the current anchor so the next IDR starts a fresh cut.
    pub fn reset_for_new_loop(&self) {
        let mut shared = self.shared.lock();
        shared.anchor = None;
        if let Some(detector) = shared.detector.as_mut() {
            detector.reset();
        }
        self.flags.idr_ready.store(false, Ordering::Release);
        self.flags.audio_ready.store(false, Ordering::Release);
    }

    /// The contiguous packet slice from the pinned anchor to the current
    /// tail. Records `last_snapshot_end` so a later `consume` picks up
    /// exactly where this left off.
    pub fn snapshot_from_anchor(&self) -> Result<Vec<TsPacket>> {
        let mut shared = self.shared.lock();
        let start = shared
            .anchor
            .as_ref()
            .ok_or_else(|| SpliceError::NotReady("no pinned anchor".into()))?
            .idr_index;
        let snapshot = shared.buffer.slice_from(start).to_vec();
        let end = shared.buffer.len();
        shared.buffer.last_snapshot_end = end;
        Ok(snapshot)
    }

    /// Fills in `pts_base`/`pcr_base`/`pcr_pts_alignment_offset` on the
    /// pinned anchor by scanning the packets already taken by
    /// `snapshot_from_anchor`.
    pub fn extract_anchor(&self, snapshot: &[TsPacket]) -> Result<SpliceAnchor> {
        use crate::ts::pes::PESHeader;

        let mut shared = self.shared.lock();
        let mut anchor = shared
            .anchor
            .clone()
            .ok_or_else(|| SpliceError::NotReady("no pinned anchor".into()))?;
        let video_pid = shared
            .probe
            .info()
            .video_pid
            .ok_or_else(|| SpliceError::NotReady("no video pid".into()))?;
        let audio_pid = shared.probe.info().audio_pid;

        let mut first_video_pts = None;
        let mut first_audio_pts = None;
        let mut first_pcr = None;

        for packet in snapshot {
            if first_pcr.is_none() {
                if let Some(pcr) = packet.pcr() {
                    first_pcr = Some(pcr);
                }
            }
            if !packet.payload_unit_start() {
                continue;
            }
            let Some(payload) = packet.payload() else {
                continue;
            };
            if packet.pid() == video_pid && first_video_pts.is_none() {
                if let Ok((header, _)) = PESHeader::parse(payload) {
                    first_video_pts = header.pts;
                }
            } else if Some(packet.pid()) == audio_pid && first_audio_pts.is_none() {
                if let Ok((header, _)) = PESHeader::parse(payload) {
                    first_audio_pts = header.pts;
                }
            }
        }

        let pts_base = match (first_video_pts, first_audio_pts) {
            (Some(v), Some(a)) => Some(v.min(a)),
            (Some(v), None) => Some(v),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        let pcr_base = first_pcr.or(pts_base.map(|p| p * 300));

        if let (Some(pts_base), Some(pcr_base)) = (pts_base, pcr_base) {
            anchor.pcr_pts_alignment_offset = Some(pts_base as i64 * 300 - pcr_base as i64);
        }
        anchor.pts_base = pts_base;
        anchor.pcr_base = pcr_base;

        shared.anchor = Some(anchor.clone());
        Ok(anchor)
    }

    /// Non-blocking pull of up to `max` packets starting at `consume_index`,
    /// waiting up to `timeout` for at least one to arrive.
    pub fn consume(&self, max: usize, timeout: Duration) -> Vec<TsPacket> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        loop {
            let start = shared.buffer.consume_index;
            if start < shared.buffer.len() {
                let end = (start + max).min(shared.buffer.len());
                let batch = shared.buffer.packets[start..end].to_vec();
                shared.buffer.consume_index = end;
                self.trim_if_needed(&mut shared);
                return batch;
            }
            let now = Instant::now();
            if now >= deadline || self.flags.stop.load(Ordering::Acquire) {
                return Vec::new();
            }
            self.cv.wait_for(&mut shared, deadline - now);
        }
    }

    /// Positions `consume_index`, typically at `last_snapshot_end`.
    pub fn init_consumption_from(&self, index: usize) {
        let mut shared = self.shared.lock();
        shared.buffer.consume_index = index;
    }

    pub fn last_snapshot_end(&self) -> usize {
        self.shared.lock().buffer.last_snapshot_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_front_shifts_indices_and_clamps_at_zero() {
        let mut buffer = RollingBuffer::new();
        for _ in 0..10 {
            buffer.push(crate::ts::types::TsPacket::from_slice(&[0x47; crate::ts::types::TS_PACKET_SIZE]).unwrap());
        }
        buffer.consume_index = 7;
        buffer.last_snapshot_end = 5;
        let mut anchor = Some(SpliceAnchor {
            idr_index: 4,
            audio_sync_index: 6,
            ..Default::default()
        });
        buffer.trim_front(5, &mut anchor);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.consume_index, 2);
        assert_eq!(buffer.last_snapshot_end, 0);
        let anchor = anchor.unwrap();
        assert_eq!(anchor.idr_index, 0);
        assert_eq!(anchor.audio_sync_index, 1);
    }

    #[test]
    fn slice_from_out_of_range_is_empty() {
        let buffer = RollingBuffer::new();
        assert!(buffer.slice_from(0).is_empty());
    }
}
