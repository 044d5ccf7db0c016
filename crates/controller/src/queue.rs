use crate::command::CommandRecord;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// FIFO between the producers (control pipe, motion detector) and the executor.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<CommandRecord>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CommandRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: CommandRecord) {
        self.lock().push_back(record);
    }

    pub fn push_all(&self, records: impl IntoIterator<Item = CommandRecord>) {
        self.lock().extend(records);
    }

    /// Take every queued command, oldest first.
    pub fn drain(&self) -> Vec<CommandRecord> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
