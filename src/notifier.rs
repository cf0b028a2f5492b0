//! Failure and completion alerts.
//!
//! Stages never decide how a failure is shown; they hand it to the
//! [`Notifier`] injected through the [`Environment`](crate::Environment).

use std::io::Write;
use std::sync::Mutex;

use console::style;

/// Receives alerts from stages, tasks and the watcher.
pub trait Notifier: Send + Sync {
    /// A unit of work failed. The caller keeps going.
    fn failure(&self, error: &(dyn std::error::Error + 'static));

    /// A task finished.
    fn success(&self, task: &str);
}

/// Logs through `tracing` and rings the terminal bell on failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct Terminal;

impl Notifier for Terminal {
    fn failure(&self, error: &(dyn std::error::Error + 'static)) {
        tracing::error!("\n\n❌  ===> ERROR: {}\n", style(error).red());

        let mut stderr = std::io::stderr();
        stderr.write_all(b"\x07").ok();
        stderr.flush().ok();
    }

    fn success(&self, task: &str) {
        tracing::info!("\n\n✅  ===> {} — completed!\n", task.to_uppercase());
    }
}

/// A single recorded alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Failure(String),
    Success(String),
}

/// Keeps alerts in memory so they can be inspected afterwards.
#[derive(Debug, Default)]
pub struct Recorder {
    notices: Mutex<Vec<Notice>>,
}

impl Recorder {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.notices()
            .into_iter()
            .filter_map(|notice| match notice {
                Notice::Failure(message) => Some(message),
                Notice::Success(_) => None,
            })
            .collect()
    }
}

impl Notifier for Recorder {
    fn failure(&self, error: &(dyn std::error::Error + 'static)) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Failure(error.to_string()));
    }

    fn success(&self, task: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(Notice::Success(task.to_string()));
    }
}
