//! Background maintenance thread
//!
//! A [`MaintenanceWorker`] runs a task every interval on its own thread
//! until it is stopped or dropped. Stopping wakes the thread immediately
//! instead of waiting out the current interval.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Periodic task runner
#[derive(Debug)]
pub struct MaintenanceWorker {
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicUsize>,
}

impl MaintenanceWorker {
    /// Run `task` every `interval` on a new thread
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn<F>(name: &str, interval: Duration, task: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicUsize::new(0));

        let thread_running = running.clone();
        let thread_ticks = ticks.clone();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("Maintenance worker started, interval {:?}", interval);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        task();
                        thread_ticks.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            thread_running.store(false, Ordering::SeqCst);
            debug!("Maintenance worker stopped");
        })?;

        info!("Started maintenance worker '{}'", name);
        Ok(Self {
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
            running,
            ticks,
        })
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Times the task has run
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it to finish
    ///
    /// Calling this more than once is harmless.
    pub fn stop(&self) {
        if let Some(sender) = self.stop.lock().take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside the task; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                warn!("Maintenance worker panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
