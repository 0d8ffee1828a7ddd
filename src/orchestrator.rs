//! Mode arbitration: decides which source is active, when to cut, and hands
//! the resulting packets to the [`Splicer`] and then the [`Sink`].
//!
//! Grounded on the reference implementation's `StreamSwitcher` (live
//! failover / privacy override) and `tcp_main.cpp` (the top-level loop that
//! drives file-sequence playback). Every switch goes through the same
//! protocol regardless of mode: unpin the entering source's anchor, wait for
//! a fresh IDR and its audio sync, extract the timing bases, then run one
//! segment.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Result, SpliceError};
use crate::monitor::Monitor;
use crate::privacy::{LogicalSource, PrivacyGate};
use crate::sink::Sink;
use crate::ts::pes::PESHeader;
use crate::ts::probe::StreamInfo;
use crate::ts::source_buffer::SourceBuffer;
use crate::ts::splicer::Splicer;
use crate::ts::types::{TsPacket, PID_AUDIO, PID_VIDEO, STREAM_TYPE_H264};

/// Running totals carried across the `Enter`/`Live` phases of one segment;
/// reset at `Exit` via [`Splicer::advance_offsets`].
struct SegmentTotals {
    pts_base: u64,
    pcr_base: u64,
    max_pts: u64,
    max_pcr: u64,
}

/// Drives one continuous output: owns the [`Splicer`] and [`Sink`] for the
/// whole run, and the [`PrivacyGate`] the dual-live mode consults at every
/// switch decision.
pub struct Orchestrator<W: std::io::Write> {
    splicer: Splicer,
    sink: Sink<W>,
    monitor: Option<Monitor>,
    privacy: Arc<PrivacyGate>,
    stop: Arc<AtomicBool>,
    first_segment: bool,
    last_psi_emit: Option<Instant>,
}

impl<W: std::io::Write> Orchestrator<W> {
    /// Builds an orchestrator that synthesizes PAT/PMT for `program_number`
    /// and writes through `sink`. No monitor is attached by default.
    pub fn new(program_number: u16, sink: Sink<W>) -> Self {
        Self {
            splicer: Splicer::new(program_number),
            sink,
            monitor: None,
            privacy: Arc::new(PrivacyGate::new()),
            stop: Arc::new(AtomicBool::new(false)),
            first_segment: true,
            last_psi_emit: None,
        }
    }

    /// Enables the diagnostic timestamp monitor on output packets.
    pub fn with_monitor(mut self) -> Self {
        self.monitor = Some(Monitor::new());
        self
    }

    /// Returns a handle an external collaborator can use to flip privacy
    /// mode without going through the orchestrator itself.
    pub fn privacy_gate(&self) -> Arc<PrivacyGate> {
        Arc::clone(&self.privacy)
    }

    /// Returns a handle an external collaborator can use to request a clean
    /// shutdown from another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Requests that the current run wind down at its next opportunity.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// File-sequence mode: runs each file in order, `loop_count` times
    /// (clamped to at least one pass). Timeline continuity across files and
    /// across loop iterations is guaranteed by `advance_offsets` alone; no
    /// other bookkeeping is needed between segments.
    pub fn run_file_sequence(&mut self, files: &[PathBuf], loop_count: u32) -> Result<()> {
        let loop_count = loop_count.max(1);
        for iteration in 0..loop_count {
            for path in files {
                if self.stopping() {
                    return Ok(());
                }
                log::info!(
                    "entering file segment {path:?} (pass {}/{loop_count})",
                    iteration + 1
                );
                self.run_one_file(path)?;
            }
        }
        self.sink.flush()
    }

    fn run_one_file(&mut self, path: &Path) -> Result<()> {
        let config = crate::config::current();
        let source = SourceBuffer::new(config.rolling_buffer_capacity);
        let owned_path = path.to_path_buf();
        source.start(
            move || std::fs::File::open(&owned_path),
            config.reassembler_max_buffer,
            config.reassembler_verify_count,
        );

        let result = self.drive_one_segment(&source, &config);
        source.stop();
        result
    }

    fn drive_one_segment(&mut self, source: &SourceBuffer, config: &Config) -> Result<()> {
        source.wait_for_idr()?;
        source.wait_for_audio_sync(Duration::from_millis(config.audio_sync_timeout_ms as u64))?;
        let info = source.wait_for_stream_info()?;

        let mut totals = self.enter_segment(source, &info)?;
        self.drain_until_exhausted(source, &info, &mut totals)?;
        self.exit_segment(totals);
        Ok(())
    }

    /// Dual-live mode: starts from whichever source becomes ready first
    /// (fallback, if both race), then fails over to fallback when primary
    /// goes silent past `max_live_gap_ms` or privacy is engaged, and returns
    /// to primary once it has been healthy for `min_consecutive_for_switch`
    /// consecutive checks. `loop_count` caps the number of Enter/Live/Exit
    /// segments run (one per source switch); `None` runs until `duration`
    /// elapses or `request_stop` is observed.
    pub fn run_dual_live<FP, RP, FF, RF>(
        &mut self,
        primary_ingress: FP,
        fallback_ingress: FF,
        duration: Option<Duration>,
        loop_count: Option<u32>,
    ) -> Result<()>
    where
        FP: FnMut() -> std::io::Result<RP> + Send + 'static,
        RP: Read,
        FF: FnMut() -> std::io::Result<RF> + Send + 'static,
        RF: Read,
    {
        let config = crate::config::current();
        let primary = SourceBuffer::new(config.rolling_buffer_capacity);
        let fallback = SourceBuffer::new(config.rolling_buffer_capacity);
        primary.start(
            primary_ingress,
            config.reassembler_max_buffer,
            config.reassembler_verify_count,
        );
        fallback.start(
            fallback_ingress,
            config.reassembler_max_buffer,
            config.reassembler_verify_count,
        );

        let deadline = duration.map(|d| Instant::now() + d);
        let mut active = LogicalSource::Fallback;
        let mut consecutive_primary_healthy = 0u32;
        let mut segments_completed = 0u32;

        // Start from whichever source is ready first; prefer the fallback
        // if the race is close, since it is assumed always-available.
        loop {
            if self.stopping() {
                primary.stop();
                fallback.stop();
                return Ok(());
            }
            if fallback.connected() && fallback.try_stream_info().is_some() {
                active = LogicalSource::Fallback;
                break;
            }
            if primary.connected() && primary.try_stream_info().is_some() {
                active = LogicalSource::Primary;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    primary.stop();
                    fallback.stop();
                    return Err(SpliceError::NotReady("no source became ready before deadline".into()));
                }
            }
        }

        while !self.stopping() {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }
            if let Some(limit) = loop_count {
                if segments_completed >= limit {
                    break;
                }
            }
            self.privacy.record_selected_source(active);
            let (source, other) = match active {
                LogicalSource::Primary => (&primary, &fallback),
                LogicalSource::Fallback => (&fallback, &primary),
            };
            log::info!(
                "switching to {:?}",
                if matches!(active, LogicalSource::Primary) { "primary" } else { "fallback" }
            );

            source.reset_for_new_loop();
            if source.wait_for_idr().is_err() {
                // Source disappeared while entering; stay on the other one.
                active = other_of(active);
                continue;
            }
            source.wait_for_audio_sync(Duration::from_millis(config.audio_sync_timeout_ms as u64))?;
            let info = source.wait_for_stream_info()?;

            let mut totals = self.enter_segment(source, &info)?;
            let mut last_activity = Instant::now();

            'live: loop {
                if self.stopping() {
                    break 'live;
                }
                if let Some(dl) = deadline {
                    if Instant::now() >= dl {
                        break 'live;
                    }
                }
                let batch = source.consume(256, Duration::from_millis(50));
                if !batch.is_empty() {
                    last_activity = Instant::now();
                    for packet in batch {
                        self.process_output_packet(packet, &info, &mut totals)?;
                    }
                    self.maybe_reemit_psi(&info)?;
                }

                match active {
                    LogicalSource::Primary => {
                        let gap = last_activity.elapsed();
                        if self.privacy.is_privacy_on() || gap > Duration::from_millis(config.max_live_gap_ms as u64)
                        {
                            log::info!("LIVE -> FALLBACK (gap={}ms)", gap.as_millis());
                            break 'live;
                        }
                    }
                    LogicalSource::Fallback => {
                        if self.primary_meets_health_floor(other, &config) {
                            consecutive_primary_healthy += 1;
                            if consecutive_primary_healthy >= config.min_consecutive_for_switch {
                                log::info!(
                                    "FALLBACK -> LIVE (consecutive={consecutive_primary_healthy})"
                                );
                                consecutive_primary_healthy = 0;
                                break 'live;
                            }
                        } else {
                            consecutive_primary_healthy = 0;
                        }
                    }
                }
            }

            self.exit_segment(totals);
            segments_completed += 1;
            active = match active {
                LogicalSource::Primary => LogicalSource::Fallback,
                LogicalSource::Fallback => LogicalSource::Primary,
            };
        }

        self.sink.flush()?;
        primary.stop();
        fallback.stop();
        Ok(())
    }

    fn primary_meets_health_floor(&self, primary: &SourceBuffer, config: &Config) -> bool {
        if self.privacy.is_privacy_on() || !primary.connected() {
            return false;
        }
        let Some(info) = primary.try_stream_info() else {
            return false;
        };
        let (video_pes, audio_pusi) = primary.media_health_counts();
        let video_ok = video_pes >= config.min_video_pes_for_health;
        let audio_ok = info.audio_pid.is_none() || audio_pusi >= config.min_audio_pusi_for_health;
        video_ok && audio_ok
    }

    /// `Enter(source)` of the segment state machine: snapshot from the
    /// pinned anchor, extract its timing bases, initialize the splicer on
    /// the very first segment of the whole run, then emit PAT/PMT/SPS+PPS
    /// followed by the rebased snapshot.
    fn enter_segment(&mut self, source: &SourceBuffer, info: &StreamInfo) -> Result<SegmentTotals> {
        let snapshot = source.snapshot_from_anchor()?;
        let anchor = source.extract_anchor(&snapshot)?;
        let pts_base = anchor.pts_base.unwrap_or(0);
        let pcr_base = anchor.pcr_base.unwrap_or(0);

        if self.first_segment {
            self.splicer.initialize(anchor.pcr_pts_alignment_offset.unwrap_or(0));
            self.first_segment = false;
        }

        self.emit_psi(info)?;
        let sps_pps_pts = self.splicer.state().global_pts_offset;
        let sps_pps = self
            .splicer
            .sps_pps_pes(&anchor.sps, &anchor.pps, PID_VIDEO, sps_pps_pts)?;
        self.sink.write_packets(&sps_pps)?;
        self.last_psi_emit = Some(Instant::now());

        let mut totals = SegmentTotals {
            pts_base,
            pcr_base,
            max_pts: self.splicer.state().global_pts_offset,
            max_pcr: self.splicer.state().global_pcr_offset,
        };
        for packet in snapshot {
            self.process_output_packet(packet, info, &mut totals)?;
        }
        source.init_consumption_from(source.last_snapshot_end());
        Ok(totals)
    }

    /// `Exit(source)`: advances the running offsets so the next segment's
    /// first rebased values land immediately after this one's.
    fn exit_segment(&mut self, totals: SegmentTotals) {
        self.splicer.advance_offsets(totals.max_pts, totals.max_pcr);
    }

    /// File-mode live phase: keeps consuming until the source disconnects
    /// (EOF) and no further packets arrive.
    fn drain_until_exhausted(
        &mut self,
        source: &SourceBuffer,
        info: &StreamInfo,
        totals: &mut SegmentTotals,
    ) -> Result<()> {
        loop {
            if self.stopping() {
                return Ok(());
            }
            let batch = source.consume(256, Duration::from_millis(50));
            if batch.is_empty() {
                if !source.connected() {
                    return Ok(());
                }
                continue;
            }
            for packet in batch {
                self.process_output_packet(packet, info, totals)?;
            }
            self.maybe_reemit_psi(info)?;
        }
    }

    fn emit_psi(&mut self, info: &StreamInfo) -> Result<()> {
        let pat = self.splicer.pat()?;
        self.sink.write_packet(&pat)?;
        let pmt = self.splicer.pmt(
            PID_VIDEO,
            info.video_stream_type.unwrap_or(STREAM_TYPE_H264),
            info.audio_pid.is_some(),
        )?;
        self.sink.write_packet(&pmt)
    }

    fn maybe_reemit_psi(&mut self, info: &StreamInfo) -> Result<()> {
        let interval = Duration::from_millis(crate::config::current().psi_reemit_interval_ms);
        let due = self
            .last_psi_emit
            .map(|t| t.elapsed() >= interval)
            .unwrap_or(true);
        if due {
            self.emit_psi(info)?;
            self.last_psi_emit = Some(Instant::now());
        }
        Ok(())
    }

    /// Remaps a source packet onto its canonical output PID, rebases its
    /// PCR/PTS/DTS, regenerates its continuity counter, tracks the running
    /// maxima for `advance_offsets`, and hands it to the sink. Packets on a
    /// PID other than this program's video or audio are dropped: the
    /// orchestrator synthesizes its own PAT/PMT rather than forwarding the
    /// source's.
    fn process_output_packet(
        &mut self,
        mut packet: TsPacket,
        info: &StreamInfo,
        totals: &mut SegmentTotals,
    ) -> Result<()> {
        let Some(canonical_pid) = remap_pid(packet.pid(), info) else {
            return Ok(());
        };
        packet.set_pid(canonical_pid);

        self.splicer.rebase(&mut packet, totals.pts_base, totals.pcr_base)?;
        self.splicer.fix_continuity(&mut packet);

        if let Some(pcr) = packet.pcr() {
            totals.max_pcr = totals.max_pcr.max(pcr);
        }
        if packet.payload_unit_start() {
            if let Some(payload) = packet.payload() {
                if let Ok((header, _)) = PESHeader::parse(payload) {
                    if let Some(pts) = header.pts {
                        totals.max_pts = totals.max_pts.max(pts);
                    }
                }
            }
        }

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.observe(&packet);
        }
        self.sink.write_packet(&packet)
    }
}

fn remap_pid(pid: u16, info: &StreamInfo) -> Option<u16> {
    if Some(pid) == info.video_pid {
        Some(PID_VIDEO)
    } else if Some(pid) == info.audio_pid {
        Some(PID_AUDIO)
    } else {
        None
    }
}

fn other_of(source: LogicalSource) -> LogicalSource {
    match source {
        LogicalSource::Primary => LogicalSource::Fallback,
        LogicalSource::Fallback => LogicalSource::Primary,
    }
}
