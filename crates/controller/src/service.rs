use crate::command::CommandReader;
use crate::config::CameraConfig;
use crate::executor::Executor;
use crate::motion::{MotionDetector, MotionParams, MotionSwitch, MotionTuning};
use crate::preview::PreviewRenderer;
use crate::queue::CommandQueue;
use crate::state::CameraState;
use anyhow::{Context, Result};
use bridge::{Fifo, MotionPipe};
use capture::SharedEngine;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

const STATUS_LOG_CYCLES: u64 = 1200;

fn spawn_named<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("Failed to spawn {} thread", name))
}

/// Wires pipes, worker threads and the executor together and runs them
/// until the shutdown flag is raised.
pub struct CameraService {
    state: CameraState,
    executor: Executor,
    queue: Arc<CommandQueue>,
    tuning: Arc<MotionTuning>,
    shutdown: Arc<AtomicBool>,
}

impl CameraService {
    pub fn new(config: CameraConfig, engine: SharedEngine, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let tuning = Arc::new(MotionTuning::new(MotionParams::from_config(&config)));
        let switch = Arc::new(MotionSwitch::new());
        let state = CameraState::initialize(config, engine, switch)?;

        Ok(Self {
            state,
            executor: Executor::new(Arc::clone(&tuning)),
            queue: Arc::new(CommandQueue::new()),
            tuning,
            shutdown,
        })
    }

    fn spawn_workers(&self) -> Result<Vec<JoinHandle<()>>> {
        let config = &self.state.config;
        let mut threads = Vec::new();

        match Fifo::setup(&config.control_file) {
            Ok(fifo) => {
                let queue = Arc::clone(&self.queue);
                let shutdown = Arc::clone(&self.shutdown);
                let poll = config.poll_interval();
                threads.push(spawn_named("control-reader", move || {
                    CommandReader::new(fifo).run(&queue, &shutdown, poll)
                })?);
            }
            Err(e) => tracing::error!(
                error = %e,
                path = %config.control_file.display(),
                "Control pipe unavailable, running without command input"
            ),
        }

        let motion_pipe = match MotionPipe::setup(&config.motion_pipe) {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %config.motion_pipe.display(),
                    "Motion pipe unavailable, motion events stay internal"
                );
                None
            }
        };

        let detector = MotionDetector::new(
            Arc::clone(self.state.engine()),
            Arc::clone(self.state.motion_switch()),
            Arc::clone(&self.tuning),
            Arc::clone(&self.queue),
            motion_pipe,
            config.motion_interval(),
        );
        let shutdown = Arc::clone(&self.shutdown);
        threads.push(spawn_named("motion-detector", move || {
            detector.run(&shutdown)
        })?);

        if config.preview_enabled {
            let renderer = PreviewRenderer::new(
                Arc::clone(self.state.engine()),
                config.preview_path.clone(),
                config.preview_size,
                config.preview_interval(),
            );
            let shutdown = Arc::clone(&self.shutdown);
            threads.push(spawn_named("preview", move || renderer.run(&shutdown))?);
        }

        Ok(threads)
    }

    pub fn run(mut self) -> Result<()> {
        tracing::info!("Camera service starting");

        let threads = match self.spawn_workers() {
            Ok(threads) => threads,
            Err(e) => {
                self.shutdown.store(true, Ordering::SeqCst);
                self.state.teardown();
                return Err(e);
            }
        };

        let poll = self.state.config.poll_interval();
        let mut cycles = 0u64;

        while !self.shutdown.load(Ordering::Relaxed) {
            for record in self.queue.drain() {
                self.executor.execute(&mut self.state, &record);
            }
            self.executor.reap(&mut self.state);
            self.executor.tick(&mut self.state, Instant::now());

            cycles += 1;
            if cycles.is_multiple_of(STATUS_LOG_CYCLES) {
                tracing::debug!(
                    status = %self.state.current_status,
                    stills_in_flight = self.executor.in_flight(),
                    motion_detected = self.state.motion_switch().detected(),
                    "Service status"
                );
            }

            thread::sleep(poll);
        }

        tracing::info!("Shutdown requested, stopping workers");
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
        self.executor.join_all(&mut self.state);
        self.state.teardown();

        tracing::info!("Camera service stopped");
        Ok(())
    }
}
