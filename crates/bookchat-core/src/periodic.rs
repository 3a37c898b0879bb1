//! Background timer threads.
//!
//! A [`PeriodicTask`] runs a closure on a dedicated named thread every
//! `interval`, waiting on a stop channel between runs so shutdown never has to
//! wait out a full period.

use crate::lock::{LockLevel, OrderedMutex};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct PeriodicTask {
    name: String,
    stop: Sender<()>,
    handle: OrderedMutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawns `tick` every `interval`. When `run_immediately` is set the first
    /// run happens before the first wait.
    ///
    /// # Errors
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn<F>(
        name: &str,
        interval: Duration,
        run_immediately: bool,
        mut tick: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, rx) = mpsc::channel::<()>();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if run_immediately {
                    tick();
                }
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!(task = %thread_name, "periodic task stopped");
            })?;
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: OrderedMutex::new(LockLevel::TaskHandle, Some(handle)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the thread and joins it. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(());
        let handle = self.handle.lock().take();
        if let Some(h) = handle
            && h.join().is_err()
        {
            tracing::error!(task = %self.name, "periodic task panicked");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
