use crate::queue::CommandQueue;
use bridge::paths::READ_CHUNK_SIZE;
use bridge::{BridgeError, Fifo};
use capture::Tuning;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Restart,
    Image,
    Record,
    MotionDetect,
    Timelapse,
    TimelapseInterval,
    Rescan,
    MotionThreshold,
    MotionInitFrames,
    MotionStartFrames,
    MotionStopFrames,
    MotionMode,
    Bitrate,
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    Shutter,
    Gain,
}

impl CommandCode {
    pub fn from_code(code: &str) -> Option<Self> {
        let code = match code {
            "ru" => CommandCode::Restart,
            "im" => CommandCode::Image,
            "ca" => CommandCode::Record,
            "md" => CommandCode::MotionDetect,
            "tl" => CommandCode::Timelapse,
            "tv" => CommandCode::TimelapseInterval,
            "sc" => CommandCode::Rescan,
            "mt" => CommandCode::MotionThreshold,
            "mi" => CommandCode::MotionInitFrames,
            "ms" => CommandCode::MotionStartFrames,
            "me" => CommandCode::MotionStopFrames,
            "mx" => CommandCode::MotionMode,
            "bi" => CommandCode::Bitrate,
            "br" => CommandCode::Brightness,
            "co" => CommandCode::Contrast,
            "sa" => CommandCode::Saturation,
            "sh" => CommandCode::Sharpness,
            "ss" => CommandCode::Shutter,
            "ag" => CommandCode::Gain,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCode::Restart => "ru",
            CommandCode::Image => "im",
            CommandCode::Record => "ca",
            CommandCode::MotionDetect => "md",
            CommandCode::Timelapse => "tl",
            CommandCode::TimelapseInterval => "tv",
            CommandCode::Rescan => "sc",
            CommandCode::MotionThreshold => "mt",
            CommandCode::MotionInitFrames => "mi",
            CommandCode::MotionStartFrames => "ms",
            CommandCode::MotionStopFrames => "me",
            CommandCode::MotionMode => "mx",
            CommandCode::Bitrate => "bi",
            CommandCode::Brightness => "br",
            CommandCode::Contrast => "co",
            CommandCode::Saturation => "sa",
            CommandCode::Sharpness => "sh",
            CommandCode::Shutter => "ss",
            CommandCode::Gain => "ag",
        }
    }

    /// The device control a tuning code maps to.
    pub fn tuning(&self) -> Option<Tuning> {
        match self {
            CommandCode::Brightness => Some(Tuning::Brightness),
            CommandCode::Contrast => Some(Tuning::Contrast),
            CommandCode::Saturation => Some(Tuning::Saturation),
            CommandCode::Sharpness => Some(Tuning::Sharpness),
            CommandCode::Shutter => Some(Tuning::Exposure),
            CommandCode::Gain => Some(Tuning::Gain),
            _ => None,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ControlPipe,
    MotionDetector,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub code: CommandCode,
    pub argument: String,
    pub origin: Origin,
}

impl CommandRecord {
    pub fn new(code: CommandCode, argument: impl Into<String>) -> Self {
        Self {
            code,
            argument: argument.into(),
            origin: Origin::ControlPipe,
        }
    }

    pub fn from_motion(code: CommandCode, argument: impl Into<String>) -> Self {
        Self {
            origin: Origin::MotionDetector,
            ..Self::new(code, argument)
        }
    }

    pub fn flag(&self) -> bool {
        is_truthy(&self.argument)
    }
}

pub fn is_truthy(argument: &str) -> bool {
    matches!(
        argument.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

/// Parse one control line: a two-character code, then the argument.
///
/// Unknown codes are logged and dropped.
pub fn parse_line(line: &str) -> Option<CommandRecord> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }

    let split = line.char_indices().nth(2).map_or(line.len(), |(i, _)| i);
    let (code, argument) = line.split_at(split);

    match CommandCode::from_code(code) {
        Some(code) => Some(CommandRecord::new(code, argument.trim_start())),
        None => {
            tracing::warn!("Unknown command {:?} ignored", line);
            None
        }
    }
}

/// Parse everything read from the control pipe in one go.
pub fn parse_batch(bytes: &[u8]) -> Vec<CommandRecord> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter_map(parse_line)
        .collect()
}

/// Longest unterminated line kept between reads before it is dropped.
const MAX_PENDING: usize = READ_CHUNK_SIZE;

/// Reads and parses commands from the control pipe.
///
/// A read that fills the whole buffer may end in the middle of a line. That
/// tail is held back and completed by the next read, or parsed as-is once
/// the pipe goes quiet.
pub struct CommandReader {
    fifo: Fifo,
    buf: [u8; READ_CHUNK_SIZE],
    pending: Vec<u8>,
    discarding: bool,
}

impl CommandReader {
    pub fn new(fifo: Fifo) -> Self {
        Self {
            fifo,
            buf: [0; READ_CHUNK_SIZE],
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// One bounded non-blocking read. An empty pipe yields no commands.
    pub fn read(&mut self) -> Result<Vec<CommandRecord>, BridgeError> {
        let n = match self.fifo.read_chunk(&mut self.buf) {
            Ok(n) => n,
            Err(BridgeError::NoDataAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        self.pending.extend_from_slice(&self.buf[..n]);

        // Rest of a line already dropped as overlong
        if self.discarding {
            match self.pending.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.pending.drain(..=end);
                    self.discarding = false;
                }
                None => {
                    self.pending.clear();
                    return Ok(Vec::new());
                }
            }
        }

        // A short read drained everything the writer sent
        let complete = if n < READ_CHUNK_SIZE {
            self.pending.len()
        } else {
            match self.pending.iter().rposition(|&b| b == b'\n') {
                Some(end) => end + 1,
                None => {
                    if self.pending.len() > MAX_PENDING {
                        tracing::warn!(
                            bytes = self.pending.len(),
                            "Discarding overlong control line"
                        );
                        self.pending.clear();
                        self.discarding = true;
                    }
                    return Ok(Vec::new());
                }
            }
        };

        let lines: Vec<u8> = self.pending.drain(..complete).collect();
        Ok(parse_batch(&lines))
    }

    /// Parse a held-back tail once no more bytes are coming for it.
    pub fn flush_pending(&mut self) -> Option<CommandRecord> {
        self.discarding = false;
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        parse_line(&String::from_utf8_lossy(&tail))
    }

    /// Ingestion loop: wait for the pipe to become readable, parse, enqueue.
    pub fn run(mut self, queue: &CommandQueue, shutdown: &AtomicBool, poll: Duration) {
        tracing::info!("Listening for commands on {}", self.fifo.path().display());

        while !shutdown.load(Ordering::Relaxed) {
            match self.fifo.wait_readable(poll) {
                Ok(false) => {
                    if let Some(record) = self.flush_pending() {
                        queue.push(record);
                    }
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Control pipe poll failed");
                    std::thread::sleep(poll);
                    continue;
                }
            }

            match self.read() {
                Ok(records) => {
                    for record in &records {
                        tracing::debug!(code = %record.code, argument = %record.argument, "Command received");
                    }
                    queue.push_all(records);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Control pipe read failed");
                    std::thread::sleep(poll);
                }
            }
        }

        tracing::info!("Command reader stopped");
    }
}
