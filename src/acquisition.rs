//! Acquisition scheduler.
//!
//! Drives the transport → decoder → demultiplexer → emitter pipeline from a
//! periodic tick, paces the work against elapsed wall-clock time and decides
//! when frames end and when the whole acquisition terminates.

use crate::decode::{decode, demux, DecodeCursor};
use crate::device::DeviceContext;
use crate::error::{Result, ScopeError};
use crate::protocol::BlockSource;
use crate::session::{self, Session};
use crate::stats::Counter;
use crossbeam_channel::{never, select, tick, Receiver};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Software-trigger search, an external collaborator: given a raw block
/// buffer, report the byte offset where the trigger condition matched.
pub trait TriggerSearch {
    fn search(&mut self, data: &[u8]) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Idle,
    Running,
    Stopped,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Stopped,
}

pub struct Acquisition<S: Session, B: BlockSource> {
    device: DeviceContext,
    session: S,
    source: B,
    state: AcqState,
    started: Instant,
    /// Microseconds of sample time already delivered.
    spent_us: u64,
    /// Samples delivered, cumulative across all channels.
    sent_samples: u64,
    /// Per-channel samples delivered into the current frame.
    frame_sent: u64,
    frames_done: u64,
    frame_open: bool,
    stop_flag: Arc<AtomicBool>,
    trigger: Option<Box<dyn TriggerSearch + Send>>,
    trigger_fired: bool,
    stats: Counter,
}

impl<S: Session, B: BlockSource> Acquisition<S, B> {
    pub fn new(device: DeviceContext, session: S, source: B) -> Self {
        Self {
            device,
            session,
            source,
            state: AcqState::Idle,
            started: Instant::now(),
            spent_us: 0,
            sent_samples: 0,
            frame_sent: 0,
            frames_done: 0,
            frame_open: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            trigger: None,
            trigger_fired: false,
            stats: Counter::new(),
        }
    }

    /// Install a software-trigger helper; sample emission is gated until it
    /// reports a match.
    pub fn with_trigger(mut self, trigger: Box<dyn TriggerSearch + Send>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn state(&self) -> AcqState {
        self.state
    }

    pub fn sent_samples(&self) -> u64 {
        self.sent_samples
    }

    pub fn stats(&self) -> &Counter {
        &self.stats
    }

    /// Handle for requesting a stop from another thread; observed at the top
    /// of the next tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state == AcqState::Running {
            return Err(ScopeError::Busy);
        }
        self.started = Instant::now();
        self.spent_us = 0;
        self.sent_samples = 0;
        self.frame_sent = 0;
        self.frames_done = 0;
        self.frame_open = false;
        self.trigger_fired = false;
        self.stop_flag.store(false, Ordering::SeqCst);
        self.stats.reset();
        self.state = AcqState::Running;

        info!(
            "acquisition started: {}/{} channels enabled at {} Hz",
            self.device.enabled_channels(),
            self.device.num_analog_channels,
            self.device.cur_samplerate
        );
        self.session.begin_stream();
        if self.device.limit_frames > 0 {
            self.session.begin_frame();
            self.frame_open = true;
        }
        Ok(())
    }

    /// One scheduler tick against real elapsed time.
    pub fn tick(&mut self) -> Tick {
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        self.tick_at(elapsed_us)
    }

    fn tick_at(&mut self, elapsed_us: u64) -> Tick {
        if self.state != AcqState::Running {
            return Tick::Stopped;
        }
        if self.stop_flag.load(Ordering::SeqCst) {
            self.finish();
            return Tick::Stopped;
        }

        let rate = self.device.cur_samplerate;
        let limit_samples = self.device.limit_samples;
        let limit_frames = self.device.limit_frames;
        let limit_us = self.device.limit_msec * 1000;

        // Outstanding work: sample time elapsed but not yet delivered,
        // clamped by the sample budget and by what remains of the frame.
        let capped_us = if limit_us > 0 {
            elapsed_us.min(limit_us)
        } else {
            elapsed_us
        };
        let todo_us = capped_us.saturating_sub(self.spent_us);
        let mut samples_todo = todo_us * rate / 1_000_000;

        let remaining_total = if limit_samples > 0 {
            limit_samples.saturating_sub(self.sent_samples)
        } else {
            u64::MAX
        };
        samples_todo = samples_todo.min(remaining_total);
        if limit_frames > 0 {
            samples_todo =
                samples_todo.min(self.device.samples_per_frame.saturating_sub(self.frame_sent));
        }

        let mut tick_done: u64 = 0;
        if samples_todo > 0 {
            match self.source.fetch_pass() {
                Err(e) => {
                    // Degrade: skip this tick's data and retry next tick.
                    warn!("skipping tick: {e}");
                }
                Ok(raw) => {
                    self.stats.record_pass(raw.len());
                    tick_done = self.deliver(&raw, samples_todo, remaining_total);
                }
            }
        }

        self.spent_us += tick_done * 1_000_000 / rate;

        // Frame bookkeeping.
        let mut frames_exhausted = false;
        if limit_frames > 0 && tick_done > 0 {
            self.frame_sent += tick_done;
            if self.frame_sent >= self.device.samples_per_frame {
                self.session.end_frame();
                self.frame_open = false;
                self.frame_sent = 0;
                self.frames_done += 1;
                frames_exhausted = self.frames_done >= limit_frames;
                if !frames_exhausted {
                    self.session.begin_frame();
                    self.frame_open = true;
                }
            }
        }

        // Termination precedence: sample limit, time limit, frame count.
        let stop = (limit_samples > 0 && self.sent_samples >= limit_samples)
            || (limit_us > 0 && self.spent_us >= limit_us)
            || frames_exhausted;
        if stop {
            self.finish();
            return Tick::Stopped;
        }
        Tick::Continue
    }

    /// Decode one raw pass and route samples to the enabled channels.
    /// Returns the largest per-channel sample count delivered.
    fn deliver(&mut self, raw: &[u8], samples_todo: u64, mut remaining: u64) -> u64 {
        // Software trigger gates emission until it fires.
        let mut start = 0usize;
        if let Some(trig) = self.trigger.as_mut() {
            if !self.trigger_fired {
                match trig.search(raw) {
                    Some(offset) => {
                        self.trigger_fired = true;
                        start = offset.min(raw.len());
                        info!("trigger fired at byte offset {start}");
                    }
                    None => return 0,
                }
            }
        }

        let num_channels = self.device.num_analog_channels;
        let mut cursor = DecodeCursor::new();
        let tagged = decode(&raw[start..], &mut cursor, num_channels);
        let mut buffers = demux(&tagged, num_channels);

        let avg = self.device.avg;
        let window = self.device.avg_samples;
        let mut tick_done: u64 = 0;

        // Every enabled channel is serviced exactly once, in index order,
        // so the shared sample budget drains reproducibly.
        for index in 0..num_channels {
            let Some(gen) = self.device.channels.get_mut(&index) else {
                continue;
            };
            if !gen.enabled {
                continue;
            }
            let mut buf = std::mem::take(&mut buffers[index]);
            let quota = samples_todo.min(remaining).min(buf.len() as u64);
            buf.truncate(quota as usize);
            let n = buf.len() as u64;

            if avg {
                for &volts in &buf {
                    gen.accumulate(volts);
                    if window > 0 && gen.num_avgs() >= window {
                        if let Some(value) = gen.take_average() {
                            session::emit(&mut self.session, gen, vec![value]);
                        }
                    }
                }
            } else {
                session::emit(&mut self.session, gen, buf);
            }

            self.sent_samples += n;
            self.stats.record_samples(n);
            remaining = remaining.saturating_sub(n);
            tick_done = tick_done.max(n);
        }
        tick_done
    }

    /// Stop the acquisition and tear down transient state. Idempotent; also
    /// the path taken by an external cancel.
    pub fn stop(&mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.state != AcqState::Running {
            return;
        }
        // Zero-window averaging defers everything to this point; flush in
        // index order.
        if self.device.avg && self.device.avg_samples == 0 {
            for index in 0..self.device.num_analog_channels {
                let Some(gen) = self.device.channels.get_mut(&index) else {
                    continue;
                };
                if !gen.enabled {
                    continue;
                }
                if let Some(value) = gen.take_average() {
                    session::emit(&mut self.session, gen, vec![value]);
                }
            }
        }
        if self.frame_open {
            self.session.end_frame();
            self.frame_open = false;
        }
        self.session.end_stream();
        self.trigger = None;
        self.trigger_fired = false;
        self.state = AcqState::Stopped;
        info!(
            "acquisition stopped: {} samples across all channels",
            self.sent_samples
        );
    }

    /// Blocking run loop: tick on a fixed interval until the acquisition
    /// terminates or a stop request arrives.
    pub fn run(&mut self, interval: Duration, stop_rx: Receiver<()>) -> Result<()> {
        self.start()?;
        let ticker = tick(interval);
        let mut stop_rx = stop_rx;
        let mut last_report = Instant::now();
        loop {
            select! {
                recv(ticker) -> _ => {
                    if let Tick::Stopped = self.tick() {
                        break;
                    }
                }
                recv(stop_rx) -> msg => {
                    if msg.is_ok() {
                        self.stop();
                        break;
                    }
                    // Sender gone; run on the acquisition's own limits.
                    stop_rx = never();
                }
            }
            if last_report.elapsed() >= Duration::from_secs(1) {
                info!(
                    "{} passes, {:.2} MB/s wire, {:.0} samples/s",
                    self.stats.n_passes,
                    self.stats.rate(),
                    self.stats.sample_rate()
                );
                last_report = Instant::now();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelGenerator;
    use crate::decode::DATA_TAG;
    use crate::session::AnalogPacket;

    fn device(num_channels: usize) -> DeviceContext {
        DeviceContext {
            cur_samplerate: 128000,
            limit_samples: 0,
            limit_msec: 0,
            limit_frames: 0,
            samples_per_frame: 1000,
            avg: false,
            avg_samples: 0,
            trigger_source: "GN14".into(),
            trigger_slope: "POS".into(),
            trigger_level: 0.0,
            num_analog_channels: num_channels,
            channels: (0..num_channels)
                .map(|i| (i, ChannelGenerator::new(i)))
                .collect(),
        }
    }

    /// Pack 13-bit values MSB-first into bytes.
    fn pack_13bit(values: &[u16]) -> Vec<u8> {
        let mut acc: u64 = 0;
        let mut bits = 0u32;
        let mut out = Vec::new();
        for &v in values {
            acc = (acc << 13) | v as u64;
            bits += 13;
            while bits >= 8 {
                bits -= 8;
                out.push((acc >> bits) as u8);
            }
        }
        if bits > 0 {
            out.push((acc << (8 - bits)) as u8);
        }
        out
    }

    fn blocks_from_values(values: &[u16]) -> Vec<u8> {
        let payload = pack_13bit(values);
        let mut buf = Vec::new();
        for chunk in payload.chunks(256) {
            buf.push(DATA_TAG);
            buf.push((chunk.len() - 1) as u8);
            buf.extend_from_slice(chunk);
        }
        buf
    }

    /// Serves a ramp of `samples_per_pass` samples on every fetch.
    struct RampSource {
        samples_per_pass: usize,
    }

    impl BlockSource for RampSource {
        fn fetch_pass(&mut self) -> crate::error::Result<Vec<u8>> {
            let values: Vec<u16> = (0..self.samples_per_pass)
                .map(|i| (i % 8192) as u16)
                .collect();
            Ok(blocks_from_values(&values))
        }
    }

    struct FailingSource;

    impl BlockSource for FailingSource {
        fn fetch_pass(&mut self) -> crate::error::Result<Vec<u8>> {
            Err(ScopeError::Transport("no data".into()))
        }
    }

    #[derive(Debug, PartialEq)]
    enum Ev {
        BeginStream,
        BeginFrame,
        EndFrame,
        EndStream,
        Packet(usize, Vec<f32>),
    }

    #[derive(Default)]
    struct Rec {
        events: Vec<Ev>,
    }

    impl Rec {
        fn packets(&self) -> Vec<(usize, usize)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Ev::Packet(ch, s) => Some((*ch, s.len())),
                    _ => None,
                })
                .collect()
        }

        fn total_emitted(&self) -> usize {
            self.packets().iter().map(|(_, n)| n).sum()
        }
    }

    impl Session for Rec {
        fn begin_stream(&mut self) {
            self.events.push(Ev::BeginStream);
        }
        fn begin_frame(&mut self) {
            self.events.push(Ev::BeginFrame);
        }
        fn end_frame(&mut self) {
            self.events.push(Ev::EndFrame);
        }
        fn end_stream(&mut self) {
            self.events.push(Ev::EndStream);
        }
        fn publish(&mut self, packet: AnalogPacket) {
            self.events.push(Ev::Packet(packet.channel, packet.samples));
        }
    }

    fn ramp_acq(device: DeviceContext) -> Acquisition<Rec, RampSource> {
        Acquisition::new(
            device,
            Rec::default(),
            RampSource {
                samples_per_pass: 16000,
            },
        )
    }

    #[test]
    fn sample_limit_never_exceeded() {
        let mut dev = device(8);
        dev.limit_samples = 100;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        let mut elapsed = 0;
        for _ in 0..10 {
            elapsed += 1_000_000;
            if acq.tick_at(elapsed) == Tick::Stopped {
                break;
            }
        }
        assert_eq!(acq.state(), AcqState::Stopped);
        assert!(acq.session.total_emitted() <= 100);
        assert_eq!(acq.sent_samples(), 100);
    }

    #[test]
    fn sample_budget_drains_in_channel_order() {
        let mut dev = device(4);
        dev.limit_samples = 10;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        // 24 µs at 128 kHz is 3 samples of outstanding work per channel;
        // the budget runs dry partway through the last channel.
        assert_eq!(acq.tick_at(24), Tick::Stopped);
        assert_eq!(
            acq.session.packets(),
            vec![(0, 3), (1, 3), (2, 3), (3, 1)]
        );
        assert_eq!(acq.sent_samples(), 10);
    }

    #[test]
    fn frame_markers_alternate_strictly() {
        let mut dev = device(8);
        dev.limit_frames = 3;
        dev.samples_per_frame = 500;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        let mut elapsed = 0;
        for _ in 0..20 {
            elapsed += 1_000_000;
            if acq.tick_at(elapsed) == Tick::Stopped {
                break;
            }
        }
        assert_eq!(acq.state(), AcqState::Stopped);

        let markers: Vec<&Ev> = acq
            .session
            .events
            .iter()
            .filter(|e| !matches!(e, Ev::Packet(..)))
            .collect();
        assert_eq!(markers[0], &Ev::BeginStream);
        assert_eq!(markers.last().unwrap(), &&Ev::EndStream);
        let frames = &markers[1..markers.len() - 1];
        assert_eq!(frames.len(), 6);
        for pair in frames.chunks(2) {
            assert_eq!(pair, [&Ev::BeginFrame, &Ev::EndFrame]);
        }
        let ends = acq
            .session
            .events
            .iter()
            .filter(|e| **e == Ev::EndStream)
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn single_frame_scenario_128khz() {
        // 128 kHz, 8 channels, one frame of 1000 samples.
        let mut dev = device(8);
        dev.limit_frames = 1;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();
        assert_eq!(
            &acq.session.events[..2],
            &[Ev::BeginStream, Ev::BeginFrame]
        );

        assert_eq!(acq.tick_at(1_000_000), Tick::Stopped);
        assert_eq!(acq.state(), AcqState::Stopped);

        let packets = acq.session.packets();
        assert_eq!(packets.len(), 8);
        for &(_, n) in &packets {
            assert_eq!(n, 1000);
        }
        let n = acq.session.events.len();
        assert_eq!(
            &acq.session.events[n - 2..],
            &[Ev::EndFrame, Ev::EndStream]
        );
    }

    #[test]
    fn time_limit_caps_delivery() {
        let mut dev = device(8);
        dev.limit_msec = 10; // 1280 samples per channel at 128 kHz
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        assert_eq!(acq.tick_at(20_000), Tick::Stopped);
        let packets = acq.session.packets();
        assert_eq!(packets.len(), 8);
        for &(_, n) in &packets {
            assert_eq!(n, 1280);
        }
    }

    #[test]
    fn zero_window_averaging_flushes_once_at_stop() {
        let mut dev = device(1);
        dev.avg = true;
        dev.avg_samples = 0;
        dev.limit_samples = 50;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        while acq.tick_at(1_000_000) == Tick::Continue {}
        assert_eq!(acq.state(), AcqState::Stopped);

        let packets = acq.session.packets();
        assert_eq!(packets, vec![(0, 1)]);

        // Exponential recurrence over the ramp, in arrival order.
        let mut expected = 0.0f32;
        for i in 0..50u16 {
            let volts = 3.3 * i as f32 / 4096.0;
            expected = (expected + volts) / 2.0;
        }
        // The flush packet goes out before the stream closes.
        let n = acq.session.events.len();
        match &acq.session.events[n - 2] {
            Ev::Packet(0, samples) => assert_eq!(samples[..], [expected]),
            other => panic!("unexpected event before stream end {other:?}"),
        }
        assert_eq!(acq.session.events[n - 1], Ev::EndStream);
    }

    #[test]
    fn averaging_window_emits_per_fill() {
        let mut dev = device(1);
        dev.avg = true;
        dev.avg_samples = 4;
        dev.limit_samples = 8;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();

        while acq.tick_at(1_000_000) == Tick::Continue {}
        let packets = acq.session.packets();
        assert_eq!(packets, vec![(0, 1), (0, 1)]);
    }

    #[test]
    fn transport_fault_degrades_to_empty_tick() {
        let dev = device(8);
        let mut acq = Acquisition::new(dev, Rec::default(), FailingSource);
        acq.start().unwrap();

        assert_eq!(acq.tick_at(100_000), Tick::Continue);
        assert_eq!(acq.tick_at(200_000), Tick::Continue);
        assert!(acq.session.packets().is_empty());
        assert_eq!(acq.sent_samples(), 0);

        acq.stop();
        assert_eq!(acq.state(), AcqState::Stopped);
        assert_eq!(acq.session.events, vec![Ev::BeginStream, Ev::EndStream]);
    }

    #[test]
    fn stop_is_idempotent_and_closes_open_frame() {
        let mut dev = device(8);
        dev.limit_frames = 2;
        let mut acq = ramp_acq(dev);
        acq.start().unwrap();
        acq.stop();
        acq.stop();
        assert_eq!(
            acq.session.events,
            vec![Ev::BeginStream, Ev::BeginFrame, Ev::EndFrame, Ev::EndStream]
        );
    }

    #[test]
    fn restart_after_stop() {
        let mut acq = ramp_acq(device(8));
        acq.start().unwrap();
        assert!(matches!(acq.start(), Err(ScopeError::Busy)));
        acq.stop();
        acq.start().unwrap();
        assert_eq!(acq.state(), AcqState::Running);
        assert_eq!(acq.sent_samples(), 0);
    }

    #[test]
    fn external_stop_short_circuits_the_tick() {
        let mut acq = ramp_acq(device(8));
        acq.start().unwrap();
        acq.stop_handle().store(true, Ordering::SeqCst);
        assert_eq!(acq.tick_at(1_000_000), Tick::Stopped);
        assert!(acq.session.packets().is_empty());
        assert_eq!(acq.session.events, vec![Ev::BeginStream, Ev::EndStream]);
    }

    struct FireOnSecond {
        calls: usize,
    }

    impl TriggerSearch for FireOnSecond {
        fn search(&mut self, _data: &[u8]) -> Option<usize> {
            self.calls += 1;
            (self.calls >= 2).then_some(0)
        }
    }

    #[test]
    fn trigger_gates_emission_until_fired() {
        let mut dev = device(1);
        dev.limit_samples = 100;
        let mut acq = ramp_acq(dev).with_trigger(Box::new(FireOnSecond { calls: 0 }));
        acq.start().unwrap();

        assert_eq!(acq.tick_at(1_000_000), Tick::Continue);
        assert!(acq.session.packets().is_empty());

        assert_eq!(acq.tick_at(2_000_000), Tick::Stopped);
        assert_eq!(acq.session.packets(), vec![(0, 100)]);
    }
}
