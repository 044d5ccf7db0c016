use crate::command::{CommandCode, CommandRecord};
use crate::config::{CameraConfig, MotionMode};
use crate::queue::CommandQueue;
use anyhow::Result;
use bridge::{BridgeError, MotionPipe};
use capture::{LumaFrame, SharedEngine, lock_engine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Flags the executor flips and the detector thread observes.
#[derive(Debug, Default)]
pub struct MotionSwitch {
    enabled: AtomicBool,
    reset_requested: AtomicBool,
    detected: AtomicBool,
}

impl MotionSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Ask the detector to clear its counters before the next frame.
    pub fn request_reset(&self) {
        self.detected.store(false, Ordering::SeqCst);
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    pub fn detected(&self) -> bool {
        self.detected.load(Ordering::SeqCst)
    }

    fn set_detected(&self, detected: bool) {
        self.detected.store(detected, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    pub threshold: f64,
    pub init_frames: u32,
    pub start_frames: u32,
    pub stop_frames: u32,
    pub mode: MotionMode,
}

impl MotionParams {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            threshold: config.motion_threshold,
            init_frames: config.motion_initframes,
            start_frames: config.motion_startframes,
            stop_frames: config.motion_stopframes,
            mode: config.motion_mode,
        }
    }
}

/// Detector parameters, updated live by the tuning commands.
#[derive(Debug)]
pub struct MotionTuning {
    params: Mutex<MotionParams>,
}

impl MotionTuning {
    pub fn new(params: MotionParams) -> Self {
        Self {
            params: Mutex::new(params),
        }
    }

    pub fn get(&self) -> MotionParams {
        *self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, f: impl FnOnce(&mut MotionParams)) {
        f(&mut self.params.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Detected,
    Cleared,
}

impl Transition {
    pub fn is_detected(&self) -> bool {
        matches!(self, Transition::Detected)
    }
}

#[derive(Debug, Default)]
pub struct MotionHysteresis {
    active_count: u32,
    still_count: u32,
    detected: bool,
    frames_seen: u32,
}

impl MotionHysteresis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame verdict. Returns the transition it caused, if any.
    pub fn feed(&mut self, above_threshold: bool, params: &MotionParams) -> Option<Transition> {
        if self.frames_seen < params.init_frames {
            self.frames_seen += 1;
            return None;
        }

        if above_threshold {
            self.active_count += 1;
            self.still_count = 0;
        } else {
            self.still_count += 1;
            self.active_count = 0;
        }

        if !self.detected && self.active_count >= params.start_frames {
            self.detected = true;
            return Some(Transition::Detected);
        }
        if self.detected && self.still_count >= params.stop_frames {
            self.detected = false;
            return Some(Transition::Cleared);
        }
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn still_count(&self) -> u32 {
        self.still_count
    }
}

/// Frame-difference motion detector, run on its own thread.
pub struct MotionDetector {
    engine: SharedEngine,
    switch: Arc<MotionSwitch>,
    tuning: Arc<MotionTuning>,
    queue: Arc<CommandQueue>,
    pipe: Option<MotionPipe>,
    interval: Duration,
    hysteresis: MotionHysteresis,
    previous: Option<LumaFrame>,
}

impl MotionDetector {
    pub fn new(
        engine: SharedEngine,
        switch: Arc<MotionSwitch>,
        tuning: Arc<MotionTuning>,
        queue: Arc<CommandQueue>,
        pipe: Option<MotionPipe>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            switch,
            tuning,
            queue,
            pipe,
            interval,
            hysteresis: MotionHysteresis::new(),
            previous: None,
        }
    }

    fn reset(&mut self) {
        self.hysteresis.reset();
        self.previous = None;
    }

    /// Evaluate one frame. `Ok(None)` covers idle, warm-up and no-change cases.
    pub fn step(&mut self) -> Result<Option<Transition>> {
        if self.switch.take_reset() {
            self.reset();
        }
        if !self.switch.is_enabled() {
            if self.previous.is_some() {
                self.reset();
            }
            return Ok(None);
        }

        let frame = {
            let mut engine = lock_engine(&self.engine);
            if !engine.is_started() {
                return Ok(None);
            }
            engine.luma_frame()?
        };

        // A resolution change after restart yields no diff and starts a fresh baseline
        let diff = self
            .previous
            .as_ref()
            .and_then(|previous| frame.mean_squared_difference(previous));
        self.previous = Some(frame);
        let Some(diff) = diff else {
            return Ok(None);
        };

        let params = self.tuning.get();
        let transition = self.hysteresis.feed(diff > params.threshold, &params);
        if let Some(transition) = transition {
            self.publish(transition, params.mode);
        }
        Ok(transition)
    }

    fn publish(&mut self, transition: Transition, mode: MotionMode) {
        let detected = transition.is_detected();
        self.switch.set_detected(detected);
        tracing::info!(detected, "Motion {}", if detected { "started" } else { "stopped" });

        if let Some(pipe) = self.pipe.as_mut() {
            match pipe.send(detected) {
                Ok(()) => {}
                Err(BridgeError::PipeFull) => {
                    tracing::debug!("Motion pipe full, event dropped");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to write motion event"),
            }
        }

        if mode == MotionMode::Internal {
            let flag = if detected { "1" } else { "0" };
            self.queue
                .push(CommandRecord::from_motion(CommandCode::Record, flag));
        }
    }

    pub fn run(mut self, shutdown: &AtomicBool) {
        tracing::info!("Motion detector running");
        let mut failures = 0u64;

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.step() {
                failures += 1;
                if failures == 1 || failures.is_multiple_of(100) {
                    tracing::warn!(failures, error = %e, "Motion frame unavailable");
                }
                self.previous = None;
            }
            std::thread::sleep(self.interval);
        }

        tracing::info!("Motion detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::{CaptureEngine, SyntheticEngine, share};

    fn params(start: u32, stop: u32) -> MotionParams {
        MotionParams {
            threshold: 7.0,
            init_frames: 0,
            start_frames: start,
            stop_frames: stop,
            mode: MotionMode::External,
        }
    }

    // ========== Hysteresis ==========

    #[test]
    fn three_active_frames_detect_once() {
        let params = params(3, 2);
        let mut hysteresis = MotionHysteresis::new();

        assert_eq!(hysteresis.feed(true, &params), None);
        assert_eq!(hysteresis.feed(true, &params), None);
        assert_eq!(hysteresis.feed(true, &params), Some(Transition::Detected));
        assert!(hysteresis.detected());
    }

    #[test]
    fn continued_motion_emits_nothing_further() {
        let params = params(3, 2);
        let mut hysteresis = MotionHysteresis::new();
        let transitions: Vec<_> = (0..10)
            .filter_map(|_| hysteresis.feed(true, &params))
            .collect();

        assert_eq!(transitions, vec![Transition::Detected]);
    }

    #[test]
    fn two_still_frames_clear_once() {
        let params = params(3, 2);
        let mut hysteresis = MotionHysteresis::new();
        for _ in 0..3 {
            hysteresis.feed(true, &params);
        }

        assert_eq!(hysteresis.feed(false, &params), None);
        assert_eq!(hysteresis.feed(false, &params), Some(Transition::Cleared));
        assert_eq!(hysteresis.feed(false, &params), None);
        assert!(!hysteresis.detected());
    }

    #[test]
    fn interrupted_activity_does_not_detect() {
        let params = params(3, 2);
        let mut hysteresis = MotionHysteresis::new();

        for above in [true, true, false, true, true, false] {
            assert_eq!(hysteresis.feed(above, &params), None);
        }
        assert_eq!(hysteresis.active_count(), 0);
        assert_eq!(hysteresis.still_count(), 1);
    }

    #[test]
    fn init_frames_are_ignored() {
        let params = MotionParams {
            init_frames: 2,
            ..params(1, 1)
        };
        let mut hysteresis = MotionHysteresis::new();

        assert_eq!(hysteresis.feed(true, &params), None);
        assert_eq!(hysteresis.feed(true, &params), None);
        assert_eq!(hysteresis.feed(true, &params), Some(Transition::Detected));
    }

    #[test]
    fn reset_clears_counts_and_detection() {
        let params = params(1, 5);
        let mut hysteresis = MotionHysteresis::new();
        hysteresis.feed(true, &params);
        assert!(hysteresis.detected());

        hysteresis.reset();

        assert!(!hysteresis.detected());
        assert_eq!(hysteresis.active_count(), 0);
        assert_eq!(hysteresis.still_count(), 0);
    }

    // ========== Detector ==========

    fn detector(mode: MotionMode) -> (MotionDetector, capture::SyntheticProbe, Arc<CommandQueue>) {
        let mut engine = SyntheticEngine::new(8, 8);
        engine.start().unwrap();
        let probe = engine.probe();
        let queue = Arc::new(CommandQueue::new());
        let switch = Arc::new(MotionSwitch::new());
        switch.enable();
        let tuning = Arc::new(MotionTuning::new(MotionParams {
            mode,
            ..params(2, 2)
        }));

        let detector = MotionDetector::new(
            share(engine),
            switch,
            tuning,
            Arc::clone(&queue),
            None,
            Duration::from_millis(1),
        );
        (detector, probe, queue)
    }

    fn alternating(count: usize) -> Vec<LumaFrame> {
        (0..count)
            .map(|i| LumaFrame::flat(8, 8, if i % 2 == 0 { 0 } else { 200 }))
            .collect()
    }

    #[test]
    fn internal_mode_queues_recording_commands() {
        let (mut detector, probe, queue) = detector(MotionMode::Internal);
        probe.push_frames(alternating(3));
        probe.push_frames(vec![LumaFrame::flat(8, 8, 0); 2]);

        let transitions: Vec<_> = (0..5).filter_map(|_| detector.step().unwrap()).collect();

        assert_eq!(transitions, vec![Transition::Detected, Transition::Cleared]);
        assert_eq!(
            queue.drain(),
            vec![
                CommandRecord::from_motion(CommandCode::Record, "1"),
                CommandRecord::from_motion(CommandCode::Record, "0"),
            ]
        );
        assert!(!detector.switch.detected());
    }

    #[test]
    fn external_mode_leaves_queue_alone() {
        let (mut detector, probe, queue) = detector(MotionMode::External);
        probe.push_frames(alternating(3));

        let transitions: Vec<_> = (0..3).filter_map(|_| detector.step().unwrap()).collect();

        assert_eq!(transitions, vec![Transition::Detected]);
        assert!(detector.switch.detected());
        assert!(queue.is_empty());
    }

    #[test]
    fn disabled_switch_consumes_no_frames() {
        let (mut detector, probe, _queue) = detector(MotionMode::External);
        detector.switch.disable();
        probe.push_frames(alternating(3));

        for _ in 0..3 {
            assert_eq!(detector.step().unwrap(), None);
        }
        assert_eq!(probe.queued_frames(), 3);
    }

    #[test]
    fn stopped_engine_is_idle() {
        let (mut detector, probe, _queue) = detector(MotionMode::External);
        lock_engine(&detector.engine).stop().unwrap();
        probe.push_frames(alternating(3));

        assert_eq!(detector.step().unwrap(), None);
        assert_eq!(probe.queued_frames(), 3);
    }

    #[test]
    fn reset_request_discards_progress() {
        let (mut detector, probe, _queue) = detector(MotionMode::External);
        probe.push_frames(alternating(2));
        detector.step().unwrap();
        detector.step().unwrap();
        assert_eq!(detector.hysteresis.active_count(), 1);

        detector.switch.request_reset();
        probe.push_frames(alternating(1));
        detector.step().unwrap();

        assert_eq!(detector.hysteresis.active_count(), 0);
        assert!(detector.previous.is_some());
    }
}
