use anyhow::{Context, Result};
use bridge::paths::part_path;
use capture::{SharedEngine, lock_engine};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Periodically refreshes a small JPEG preview for external viewers.
pub struct PreviewRenderer {
    engine: SharedEngine,
    path: PathBuf,
    part: PathBuf,
    size: [u32; 2],
    interval: Duration,
}

impl PreviewRenderer {
    pub fn new(engine: SharedEngine, path: PathBuf, size: [u32; 2], interval: Duration) -> Self {
        let part = part_path(&path);
        Self {
            engine,
            path,
            part,
            size,
            interval,
        }
    }

    /// Write one preview. Returns false when the engine is not running.
    pub fn render(&self) -> Result<bool> {
        let jpeg = {
            let mut engine = lock_engine(&self.engine);
            if !engine.is_started() {
                return Ok(false);
            }
            engine.preview_jpeg(self.size[0], self.size[1])?
        };

        fs::write(&self.part, &jpeg)
            .with_context(|| format!("Failed to write {}", self.part.display()))?;
        fs::rename(&self.part, &self.path)
            .with_context(|| format!("Failed to publish {}", self.path.display()))?;
        Ok(true)
    }

    pub fn run(self, shutdown: &AtomicBool) {
        tracing::info!(
            "Preview renderer writing {}x{} to {} every {:?}",
            self.size[0],
            self.size[1],
            self.path.display(),
            self.interval
        );
        let mut failures = 0u64;

        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            match self.render() {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures.is_multiple_of(100) {
                        tracing::warn!(failures, "Preview failed: {:#}", e);
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            } else {
                tracing::trace!("Preview took longer than its interval: {:?}", elapsed);
            }
        }

        tracing::info!("Preview renderer stopped");
    }
}
