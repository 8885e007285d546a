//! Bounded buffers of worker output, and relay of worker log records.

use std::collections::VecDeque;

use serde::Serialize;

use crate::worker::WorkerMessage;

/// Default capacity of each buffer.
pub const LOG_CAPACITY: usize = 500;

/// Fixed-capacity FIFO; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSnapshot {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub messages: Vec<WorkerMessage>,
}

/// Raw stdout, raw stderr, and parsed status records of the worker.
#[derive(Debug, Clone)]
pub struct WorkerLogs {
    stdout: RingBuffer<String>,
    stderr: RingBuffer<String>,
    messages: RingBuffer<WorkerMessage>,
}

impl WorkerLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            stdout: RingBuffer::new(capacity),
            stderr: RingBuffer::new(capacity),
            messages: RingBuffer::new(capacity),
        }
    }

    /// Record a stdout line, returning the status record it carried, if any.
    pub fn push_stdout(&mut self, line: String) -> Option<WorkerMessage> {
        let message = WorkerMessage::parse(&line);
        if let Some(message) = &message {
            self.messages.push(message.clone());
        }
        self.stdout.push(line);
        message
    }

    pub fn push_stderr(&mut self, line: String) {
        self.stderr.push(line);
    }

    pub fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            stdout: self.stdout.to_vec(),
            stderr: self.stderr.to_vec(),
            messages: self.messages.to_vec(),
        }
    }
}

impl Default for WorkerLogs {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

/// Re-emit a worker log record through the supervisor's own subscriber.
pub fn relay(level: &str, text: &str) {
    match level {
        "error" => tracing::error!(target: "toolgate::worker", "{text}"),
        "warn" => tracing::warn!(target: "toolgate::worker", "{text}"),
        "debug" => tracing::debug!(target: "toolgate::worker", "{text}"),
        "trace" => tracing::trace!(target: "toolgate::worker", "{text}"),
        _ => tracing::info!(target: "toolgate::worker", "{text}"),
    }
}
