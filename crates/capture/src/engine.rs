//! Stream state machine and the dequeue/consume/requeue loop.
//!
//! ```text
//! Idle -> Armed -> Streaming -> Recovering -> Armed ...
//!                            \-> Draining -> Stopped
//! ```

use std::{
    fmt,
    path::Path,
    thread,
    time::Instant,
};

use smallvec::SmallVec;
use strobe_core::prelude::*;

use crate::{
    frame::{Frame, FrameConsumer},
    options::CaptureOptions,
    pool::BufferPool,
    sink::FrameSink,
};

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EngineState {
    /// No buffers negotiated.
    Idle,
    /// Buffers negotiated, prepared and queued; stream still off.
    Armed,
    /// Stream on; dequeuing and delivering frames.
    Streaming,
    /// Stream stopped after a source change; waiting for stable timings.
    Recovering,
    /// Stream off and buffers being released.
    Draining,
    /// Teardown finished; the next `run` starts over from `Idle`.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Armed => "armed",
            EngineState::Streaming => "streaming",
            EngineState::Recovering => "recovering",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StopReason {
    /// The requested number of frames was delivered.
    TargetReached,
    /// The consumer returned `false`.
    ConsumerStopped,
    /// The driver raised an end-of-stream event.
    EndOfStream,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TargetReached => "target reached",
            StopReason::ConsumerStopped => "stopped by consumer",
            StopReason::EndOfStream => "end of stream",
        };
        f.write_str(text)
    }
}

/// Counters reported when a session ends cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: StopReason,
    /// Frames handed to the consumer across every recovered session.
    pub delivered: u64,
    /// Frames delivered since the last (re)arm.
    pub session_frames: u64,
    pub skipped: u64,
    /// Errored buffers recycled without delivery.
    pub errored: u64,
    pub recoveries: u64,
    /// Bytes appended to the sink.
    pub sink_bytes: u64,
    pub last_fps: Option<FpsSample>,
    pub format: Option<FormatInfo>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames captured ({}), {} skipped, {} errored, {} recoveries",
            self.delivered, self.reason, self.skipped, self.errored, self.recoveries
        )?;
        if let Some(fps) = self.last_fps {
            write!(f, ", {fps}")?;
        }
        Ok(())
    }
}

/// Transient per-run state. Lives for one `run` call; recovery keeps it.
#[derive(Debug)]
struct SessionState {
    buffers_queued: bool,
    frames: u64,
    skip: u32,
    remaining: Option<u32>,
    fps: FpsMeter,
    end_of_stream: bool,
    source_changed: bool,
    format: Option<FormatInfo>,
}

impl SessionState {
    fn new(target: u32, skip: u32) -> Self {
        Self {
            buffers_queued: false,
            frames: 0,
            skip,
            remaining: (target > 0).then_some(target),
            fps: FpsMeter::default(),
            end_of_stream: false,
            source_changed: false,
            format: None,
        }
    }

    /// Start over after a source change. Target and skip budget carry over.
    fn rearm(&mut self) {
        self.buffers_queued = false;
        self.frames = 0;
        self.fps.reset();
        self.source_changed = false;
    }
}

/// How a streaming pass ended.
enum Exit {
    Recover,
    Stop(StopReason),
}

/// Drives one device through arm, stream, recover and drain.
///
/// The engine borrows the driver for its lifetime and owns the buffer pool of each
/// run. Teardown (stream-off, release, free) runs exactly once per `run` on every
/// exit path.
///
/// # Example
/// ```rust
/// use strobe_capture::prelude::*;
///
/// let mut driver = VirtualDriver::new();
/// let mut engine = CaptureEngine::new(&mut driver, CaptureOptions::new().skip_frames(1));
/// let summary = engine.run(None, 2, |_: &Frame<'_>| true).unwrap();
/// assert_eq!(summary.reason, StopReason::TargetReached);
/// assert_eq!((summary.delivered, summary.skipped), (2, 1));
/// assert_eq!(engine.state(), EngineState::Stopped);
/// ```
pub struct CaptureEngine<'d, D: Driver + ?Sized> {
    driver: &'d mut D,
    options: CaptureOptions,
    state: EngineState,
    metrics: Metrics,
}

impl<'d, D: Driver + ?Sized> CaptureEngine<'d, D> {
    pub fn new(driver: &'d mut D, options: CaptureOptions) -> Self {
        Self {
            driver,
            options: options.sanitized(),
            state: EngineState::Idle,
            metrics: Metrics::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Options in effect, after clamping.
    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Counters accumulated over every `run` of this engine.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Capture until `target` frames were delivered (0 = unbounded), the consumer
    /// returns `false`, or the driver signals end of stream.
    ///
    /// Payloads go to `sink` when a non-empty path is given.
    pub fn run<C: FrameConsumer>(
        &mut self,
        sink: Option<&Path>,
        target: u32,
        mut consumer: C,
    ) -> Result<SessionSummary, CaptureError> {
        let mut sink = FrameSink::open(sink)?;
        let mut session = SessionState::new(target, self.options.skip_frames);
        let before = self.metrics.clone();
        self.set_state(EngineState::Idle);
        tracing::info!(
            frames = target,
            buffers = self.options.buffer_count,
            memory = ?self.options.memory,
            queue = ?self.options.queue,
            "capture session starting"
        );
        if self.options.subscribe_events {
            self.subscribe_events();
        }

        let mut pool = BufferPool::new(self.options.queue, self.options.memory, 1);
        let outcome = loop {
            let step = self
                .arm(&mut pool, &mut session)
                .and_then(|()| self.stream(&mut pool, &mut session, &mut sink, &mut consumer));
            match step {
                Ok(Exit::Recover) => {
                    self.set_state(EngineState::Recovering);
                    self.disarm(&mut pool);
                    if let Err(err) = self.await_stable_timings() {
                        break Err(err);
                    }
                    self.metrics.recovered();
                    session.rearm();
                }
                Ok(Exit::Stop(reason)) => break Ok(reason),
                Err(err) => break Err(err),
            }
        };

        self.set_state(EngineState::Draining);
        self.disarm(&mut pool);
        let closed = sink.finish();
        self.set_state(EngineState::Stopped);

        let reason = match (outcome, closed) {
            (Ok(reason), Ok(())) => reason,
            (Err(err), _) | (Ok(_), Err(err)) => {
                tracing::warn!(code = err.code(), error = %err, "capture session failed");
                return Err(err);
            }
        };
        let summary = SessionSummary {
            reason,
            delivered: self.metrics.delivered_count() - before.delivered_count(),
            session_frames: session.frames,
            skipped: self.metrics.skipped_count() - before.skipped_count(),
            errored: self.metrics.errored_count() - before.errored_count(),
            recoveries: self.metrics.recovery_count() - before.recovery_count(),
            sink_bytes: sink.written(),
            last_fps: session.fps.last(),
            format: session.format,
        };
        tracing::info!(%summary, "capture session finished");
        Ok(summary)
    }

    fn set_state(&mut self, next: EngineState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "engine state");
            self.state = next;
        }
    }

    fn subscribe_events(&mut self) {
        for kind in [EventKind::EndOfStream, EventKind::SourceChange] {
            if let Err(err) = self.driver.subscribe(kind) {
                tracing::debug!(event = ?kind, error = %err, "event subscription rejected");
            }
        }
    }

    /// Idle -> Armed: read the format, negotiate, export if needed, prepare and queue.
    fn arm(
        &mut self,
        pool: &mut BufferPool,
        session: &mut SessionState,
    ) -> Result<(), CaptureError> {
        let queue = self.options.queue;
        let format = self.driver.format(queue)?;
        tracing::debug!(%format, "current format");
        session.format = Some(format);

        *pool = BufferPool::new(queue, self.options.memory, format.planes);
        pool.negotiate(&mut *self.driver, self.options.buffer_count)?;
        if self.options.memory == MemoryMode::Exported {
            pool.export(&mut *self.driver, queue)?;
        }
        pool.prepare(&mut *self.driver)?;
        session.buffers_queued = true;
        self.set_state(EngineState::Armed);
        Ok(())
    }

    /// Armed -> Streaming, then loop until a terminal flag or stop condition.
    fn stream<C: FrameConsumer>(
        &mut self,
        pool: &mut BufferPool,
        session: &mut SessionState,
        sink: &mut FrameSink,
        consumer: &mut C,
    ) -> Result<Exit, CaptureError> {
        debug_assert!(session.buffers_queued);
        self.driver.stream_on(self.options.queue)?;
        self.set_state(EngineState::Streaming);
        loop {
            if session.end_of_stream {
                return Ok(Exit::Stop(StopReason::EndOfStream));
            }
            if session.source_changed {
                return Ok(Exit::Recover);
            }
            let ready = match self.driver.wait(self.options.wait_timeout) {
                Ok(ready) => ready,
                Err(err) if err.errno == libc::EINTR => continue,
                Err(err) => return Err(err.into()),
            };
            if ready.event {
                self.drain_events(session)?;
                if session.end_of_stream || session.source_changed {
                    continue;
                }
            }
            if !ready.buffer {
                continue;
            }
            if let Some(exit) = self.consume_one(pool, session, sink, consumer)? {
                return Ok(exit);
            }
        }
    }

    fn drain_events(&mut self, session: &mut SessionState) -> Result<(), CaptureError> {
        while let Some(event) = self.driver.dequeue_event()? {
            match event {
                DriverEvent::EndOfStream => {
                    tracing::info!("end of stream");
                    session.end_of_stream = true;
                }
                DriverEvent::SourceChange { changes } => {
                    tracing::warn!(changes, "source changed");
                    session.source_changed = true;
                }
                DriverEvent::Other(kind) => tracing::debug!(kind, "ignoring event"),
            }
        }
        Ok(())
    }

    /// Dequeue one buffer and run it through skip, sink, consumer and requeue.
    ///
    /// `None` keeps the stream going.
    fn consume_one<C: FrameConsumer>(
        &mut self,
        pool: &mut BufferPool,
        session: &mut SessionState,
        sink: &mut FrameSink,
        consumer: &mut C,
    ) -> Result<Option<Exit>, CaptureError> {
        let (queue, memory) = (self.options.queue, self.options.memory);
        let buf = match self.driver.dequeue_buffer(queue, memory, pool.planes()) {
            Ok(buf) => buf,
            Err(err) if err.would_block() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        pool.mark_dequeued(buf.index);

        if buf.errored {
            tracing::warn!(index = buf.index, sequence = buf.sequence, "recycling errored buffer");
            self.metrics.errored();
            pool.queue_slot(&mut *self.driver, buf.index)?;
            return Ok(None);
        }

        if let Some(sample) = session.fps.record(Instant::now()) {
            tracing::info!(fps = %sample, "frame rate");
        }

        if session.skip > 0 {
            session.skip -= 1;
            self.metrics.skipped();
            tracing::debug!(index = buf.index, left = session.skip, "skipping frame");
            pool.queue_slot(&mut *self.driver, buf.index)?;
            return Ok(None);
        }

        let planes: SmallVec<[&[u8]; 3]> = buf
            .planes
            .iter()
            .enumerate()
            .map(|(plane, usage)| pool.payload(buf.index, plane, *usage).unwrap_or_default())
            .collect();
        let frame = Frame::new(buf.index, buf.sequence, buf.timestamp, planes);
        sink.write(&frame)?;
        session.frames += 1;
        self.metrics.delivered();
        let keep_going = consumer.consume(&frame);
        drop(frame);

        if !keep_going {
            tracing::debug!(sequence = buf.sequence, "consumer requested stop");
            return Ok(Some(Exit::Stop(StopReason::ConsumerStopped)));
        }
        if let Some(remaining) = session.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                return Ok(Some(Exit::Stop(StopReason::TargetReached)));
            }
        }
        pool.queue_slot(&mut *self.driver, buf.index)?;
        Ok(None)
    }

    /// Stream off, release every buffer and free them on the driver side. Failures are
    /// logged and ignored.
    fn disarm(&mut self, pool: &mut BufferPool) {
        let queue = self.options.queue;
        if let Err(err) = self.driver.stream_off(queue) {
            tracing::warn!(error = %err, "stream off failed");
        }
        pool.release();
        if pool.count() > 0
            && let Err(err) = self.driver.request_buffers(queue, pool.memory(), 0)
        {
            tracing::warn!(error = %err, "freeing buffers failed");
        }
        *pool = BufferPool::new(queue, self.options.memory, pool.planes());
    }

    /// Query timings until the driver reports a stable signal.
    fn await_stable_timings(&mut self) -> Result<(), CaptureError> {
        let mut attempts = 0u32;
        loop {
            match self.driver.settle_timings()? {
                TimingStatus::Settled => {
                    tracing::info!(attempts, "signal settled");
                    return Ok(());
                }
                TimingStatus::NotApplicable => return Ok(()),
                TimingStatus::Pending => {
                    attempts += 1;
                    if let Some(max) = self.options.max_recovery_attempts
                        && attempts >= max
                    {
                        return Err(CaptureError::RecoveryExhausted { attempts });
                    }
                    tracing::debug!(attempts, "no stable signal yet");
                    thread::sleep(self.options.recovery_interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::virtual_backend::VirtualDriver;

    fn fast() -> CaptureOptions {
        CaptureOptions::new()
            .wait_timeout(Duration::ZERO)
            .recovery_interval(Duration::from_millis(1))
    }

    #[test]
    fn errored_buffers_are_recycled_not_delivered() {
        let mut driver = VirtualDriver::new().error_on_dequeue(2).error_on_dequeue(3);
        let stats = driver.stats();
        let mut seen = Vec::new();
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 3, |frame: &Frame<'_>| {
                seen.push(frame.sequence());
                true
            })
            .unwrap();
        assert_eq!(seen, [0, 3, 4]);
        assert_eq!(summary.errored, 2);
        // 4 initial queues + 2 recycled errored + 2 requeued deliveries.
        assert_eq!(stats.queued(), 8);
    }

    #[test]
    fn skipped_frames_never_reach_consumer() {
        let mut driver = VirtualDriver::new();
        let mut seen = Vec::new();
        let summary = CaptureEngine::new(&mut driver, fast().skip_frames(3))
            .run(None, 2, |frame: &Frame<'_>| {
                seen.push(frame.sequence());
                true
            })
            .unwrap();
        assert_eq!(seen, [3, 4]);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.delivered, 2);
    }

    #[test]
    fn consumer_stop_prevents_further_deliveries() {
        let mut driver = VirtualDriver::new();
        let stats = driver.stats();
        let mut calls = 0;
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 0, |_: &Frame<'_>| {
                calls += 1;
                calls < 4
            })
            .unwrap();
        assert_eq!(summary.reason, StopReason::ConsumerStopped);
        assert_eq!(calls, 4);
        assert_eq!(stats.dequeued(), 4);
        assert_eq!(stats.stream_off(), 1);
        assert_eq!(stats.live_mappings(), 0);
        assert_eq!(driver.allocated(), 0);
    }

    #[test]
    fn end_of_stream_drains() {
        let mut driver = VirtualDriver::new().event_after(5, DriverEvent::EndOfStream);
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 0, |_: &Frame<'_>| true)
            .unwrap();
        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.delivered, 5);
        assert!(!driver.is_streaming());
    }

    #[test]
    fn source_change_recovers_and_keeps_target() {
        let mut driver = VirtualDriver::new()
            .event_after(2, DriverEvent::SourceChange { changes: 1 })
            .pending_timings(2);
        let stats = driver.stats();
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 5, |_: &Frame<'_>| true)
            .unwrap();
        assert_eq!(summary.reason, StopReason::TargetReached);
        assert_eq!(summary.delivered, 5);
        assert_eq!(summary.session_frames, 3);
        assert_eq!(summary.recoveries, 1);
        assert_eq!(stats.timing_queries(), 3);
        assert_eq!(stats.stream_on(), 2);
        assert_eq!(stats.stream_off(), 2);
        assert_eq!(stats.live_mappings(), 0);
    }

    #[test]
    fn recovery_picks_up_new_plane_count() {
        let nv12 = FormatInfo {
            fourcc: FourCc::new(*b"NV12"),
            width: 1280,
            height: 720,
            planes: 2,
        };
        let mut driver = VirtualDriver::new()
            .event_after(1, DriverEvent::SourceChange { changes: 1 })
            .with_format_after_change(nv12);
        let mut plane_counts = Vec::new();
        let summary = CaptureEngine::new(
            &mut driver,
            fast().queue(QueueType::VideoCaptureMplane),
        )
        .run(None, 3, |frame: &Frame<'_>| {
            plane_counts.push(frame.planes().len());
            true
        })
        .unwrap();
        assert_eq!(plane_counts, [1, 2, 2]);
        assert_eq!(summary.format, Some(nv12));
    }

    #[test]
    fn bounded_recovery_gives_up() {
        let mut driver = VirtualDriver::new()
            .event_after(1, DriverEvent::SourceChange { changes: 1 })
            .pending_timings(10);
        let stats = driver.stats();
        let mut engine = CaptureEngine::new(&mut driver, fast().max_recovery_attempts(Some(3)));
        let err = engine.run(None, 5, |_: &Frame<'_>| true).unwrap_err();
        assert!(matches!(err, CaptureError::RecoveryExhausted { attempts: 3 }));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(stats.live_mappings(), 0);
    }

    #[test]
    fn negotiation_failure_never_streams() {
        let mut driver = VirtualDriver::new().fail_request_buffers(libc::EBUSY);
        let stats = driver.stats();
        let mut engine = CaptureEngine::new(&mut driver, fast());
        let err = engine.run(None, 1, |_: &Frame<'_>| true).unwrap_err();
        assert_eq!(err.code(), "V007");
        assert_eq!(stats.stream_on(), 0);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn broken_queue_ends_session_through_teardown() {
        let mut driver = VirtualDriver::new().queue_error_after(2);
        let stats = driver.stats();
        let mut delivered = 0;
        let mut engine = CaptureEngine::new(&mut driver, fast());
        let err = engine
            .run(None, 5, |_: &Frame<'_>| {
                delivered += 1;
                true
            })
            .unwrap_err();
        assert_eq!(err.code(), "V006");
        assert_eq!(err.control().map(|c| c.errno), Some(libc::EIO));
        assert_eq!(delivered, 2);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.metrics().delivered_count(), 2);
        drop(engine);
        assert_eq!(stats.stream_off(), 1);
        assert_eq!(stats.live_mappings(), 0);
        assert_eq!(driver.allocated(), 0);
    }

    #[test]
    fn stream_off_failure_is_ignored() {
        let mut driver = VirtualDriver::new().fail_stream_off(libc::EIO);
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 1, |_: &Frame<'_>| true)
            .unwrap();
        assert_eq!(summary.delivered, 1);
    }

    #[test]
    fn works_without_event_support() {
        let mut driver = VirtualDriver::new().without_events();
        let summary = CaptureEngine::new(&mut driver, fast())
            .run(None, 2, |_: &Frame<'_>| true)
            .unwrap();
        assert_eq!(summary.delivered, 2);
        assert!(driver.subscriptions().is_empty());
    }

    #[test]
    fn userptr_frames_carry_driver_written_bytes() {
        let mut driver = VirtualDriver::new().with_plane_len(8).with_fill(8, 0);
        let mut frames = Vec::new();
        CaptureEngine::new(&mut driver, fast().memory(MemoryMode::UserPtr).buffer_count(2))
            .run(None, 3, |frame: &Frame<'_>| {
                frames.push((frame.index(), frame.data().to_vec()));
                true
            })
            .unwrap();
        for (index, bytes) in frames {
            assert_eq!(bytes, vec![VirtualDriver::pattern(index, 0); 8]);
        }
    }

    #[test]
    fn metrics_accumulate_across_runs() {
        let mut driver = VirtualDriver::new();
        let mut engine = CaptureEngine::new(&mut driver, fast());
        engine.run(None, 2, |_: &Frame<'_>| true).unwrap();
        let second = engine.run(None, 3, |_: &Frame<'_>| true).unwrap();
        assert_eq!(second.delivered, 3);
        assert_eq!(engine.metrics().delivered_count(), 5);
    }
}
