//! Job log bus
//!
//! The orchestrator narrates each step and forwards every provider log line
//! to a [`LogSink`]. Publishing never blocks: subscribers get bounded
//! channels and a line is dropped for a subscriber whose channel is full or
//! closed. A capped per-job history lets late subscribers catch up.
//!
//! At most `RETAINED_JOBS` jobs are kept. Once that many exist, the oldest
//! job without a live subscriber is forgotten to make room. Callers that
//! know a job is finished can `clear` it right away.

use chrono::{DateTime, Utc};
use sdk::protocol::LogLevel;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Lines of history kept per job
const HISTORY_LIMIT: usize = 1000;

/// Jobs whose history is kept before idle ones are evicted
const RETAINED_JOBS: usize = 64;

/// Receiver of job log lines
///
/// Implementations must return promptly and must not fail the caller.
pub trait LogSink: Send + Sync {
    fn publish(&self, job_id: &str, level: LogLevel, message: &str);
}

/// One published log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLogLine {
    pub job_id: String,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Default)]
struct JobChannel {
    subscribers: Vec<mpsc::Sender<JobLogLine>>,
    history: VecDeque<JobLogLine>,
}

impl JobChannel {
    fn is_idle(&self) -> bool {
        self.subscribers.iter().all(|tx| tx.is_closed())
    }
}

/// Job channels plus their creation order
#[derive(Default)]
struct Jobs {
    channels: HashMap<String, JobChannel>,
    order: VecDeque<String>,
}

impl Jobs {
    fn channel(&mut self, job_id: &str) -> &mut JobChannel {
        if !self.channels.contains_key(job_id) {
            self.evict_idle();
            self.order.push_back(job_id.to_string());
        }
        self.channels.entry(job_id.to_string()).or_default()
    }

    /// Drop the oldest idle jobs until there is room for one more
    fn evict_idle(&mut self) {
        while self.channels.len() >= RETAINED_JOBS {
            let channels = &self.channels;
            let idle = self
                .order
                .iter()
                .position(|id| channels.get(id).map_or(true, JobChannel::is_idle));
            let Some(id) = idle.and_then(|i| self.order.remove(i)) else {
                break;
            };
            self.channels.remove(&id);
        }
    }

    fn remove(&mut self, job_id: &str) {
        self.channels.remove(job_id);
        self.order.retain(|id| id != job_id);
    }
}

/// In-process fan-out of job log lines
#[derive(Default)]
pub struct JobLogBus {
    jobs: Mutex<Jobs>,
    /// Subscribers that receive every job's lines
    global: Mutex<Vec<mpsc::Sender<JobLogLine>>>,
}

impl JobLogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one job's lines
    ///
    /// The channel is bounded with CHANNEL_BUFFER_SIZE capacity.
    pub fn subscribe(&self, job_id: &str) -> mpsc::Receiver<JobLogLine> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.channel(job_id).subscribers.push(tx);
        }
        rx
    }

    /// Subscribe to lines from every job
    pub fn subscribe_all(&self) -> mpsc::Receiver<JobLogLine> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        if let Ok(mut global) = self.global.lock() {
            global.push(tx);
        }
        rx
    }

    /// Lines published for a job so far, oldest first
    pub fn history(&self, job_id: &str) -> Vec<JobLogLine> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| {
                jobs.channels
                    .get(job_id)
                    .map(|c| c.history.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Forget a finished job's history and subscribers
    pub fn clear(&self, job_id: &str) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(job_id);
        }
    }
}

/// Send without waiting, dropping closed subscribers
fn fan_out(subscribers: &mut Vec<mpsc::Sender<JobLogLine>>, line: &JobLogLine) {
    subscribers.retain(|tx| match tx.try_send(line.clone()) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

impl LogSink for JobLogBus {
    fn publish(&self, job_id: &str, level: LogLevel, message: &str) {
        let line = JobLogLine {
            job_id: job_id.to_string(),
            ts: Utc::now(),
            level,
            message: message.to_string(),
        };

        if let Ok(mut jobs) = self.jobs.lock() {
            let channel = jobs.channel(job_id);
            if channel.history.len() == HISTORY_LIMIT {
                channel.history.pop_front();
            }
            channel.history.push_back(line.clone());
            fan_out(&mut channel.subscribers, &line);
        }

        if let Ok(mut global) = self.global.lock() {
            fan_out(&mut global, &line);
        }
    }
}
