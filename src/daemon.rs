//! The update daemon.
//!
//! The daemon periodically runs a full validation and publishes the
//! resulting data set. It owns the single background thread that is the
//! only writer of the shared payload history.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use log::{debug, error, info};
use rpki::rtr::server::NotifySender;
use crate::engine::Engine;
use crate::error::Failed;
use crate::metrics::Metrics;
use crate::payload::{SharedHistory, UpdateOutcome, ValidationReport};


//------------ UpdateDaemon --------------------------------------------------

/// A handle to the background update thread.
///
/// The thread is started through [`spawn`][Self::spawn] and runs until the
/// handle is dropped or [`stop`][Self::stop] is called. Stopping wakes the
/// thread at its sleep point and joins it, so no cycle is ever torn down
/// in the middle.
#[derive(Debug)]
pub struct UpdateDaemon {
    /// The channel used to wake the thread up for shutdown.
    stop: Sender<()>,

    /// The join handle of the thread.
    thread: Option<JoinHandle<()>>,
}

impl UpdateDaemon {
    /// Spawns the update daemon thread.
    ///
    /// The thread runs a first validation immediately and then sleeps for
    /// `interval` between subsequent runs.
    pub fn spawn(
        engine: Engine,
        history: SharedHistory,
        notify: NotifySender,
        interval: Duration,
    ) -> Result<Self, Failed> {
        let (stop, wakeup) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("updates".into())
            .spawn(move || {
                daemon_loop(engine, history, notify, interval, wakeup)
            })
            .map_err(|err| {
                error!("Failed to spawn the update thread: {}", err);
                Failed
            })?;
        Ok(UpdateDaemon {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the daemon and waits for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown()
    }

    /// The actual shutdown, shared with `Drop`.
    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UpdateDaemon {
    fn drop(&mut self) {
        self.shutdown()
    }
}


//------------ The Daemon Loop -----------------------------------------------

/// Runs update cycles until the shutdown channel fires.
fn daemon_loop(
    engine: Engine,
    history: SharedHistory,
    notify: NotifySender,
    interval: Duration,
    wakeup: Receiver<()>,
) {
    loop {
        run_cycle(&engine, &history, &notify);
        match wakeup.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => {
                debug!("Update daemon shutting down.");
                return
            }
        }
    }
}

/// Performs a single update cycle.
///
/// Runs a full validation into a fresh report. If validation fails, the
/// report is dropped and the previously published data stays as is: a
/// stale data set is better than a partial one. Otherwise the new data is
/// handed to the history which decides whether anything changed.
fn run_cycle(
    engine: &Engine,
    history: &SharedHistory,
    notify: &NotifySender,
) {
    history.mark_update_start();
    let (report, mut metrics) = match engine.process_payload() {
        Ok(some) => some,
        Err(_) => {
            error!(
                "Validation failed. Keeping the previous data set \
                 and sleeping."
            );
            return
        }
    };
    process_report(report, history, notify, &mut metrics);
    history.mark_update_done();
}

/// Publishes the outcome of a successful validation run.
fn process_report(
    report: ValidationReport,
    history: &SharedHistory,
    notify: &NotifySender,
    metrics: &mut Metrics,
) {
    match history.update(report, metrics) {
        UpdateOutcome::Initial => {
            info!("Installed the initial data set. Sleeping.");
        }
        UpdateOutcome::Changed => {
            info!("Data set updated. Notifying clients and sleeping.");
            notify.notify();
        }
        UpdateOutcome::Unchanged => {
            debug!("No changes. Sleeping.");
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use rpki::rtr::state::Serial;
    use crate::config::Config;

    fn test_engine(dir: &std::path::Path) -> Engine {
        let config = Config::test_config(dir);
        fs::create_dir_all(&config.tal_dir).unwrap();
        Engine::new(&config).unwrap()
    }

    #[test]
    fn cycles_against_empty_tal_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let config = Config::test_config(dir.path());
        let history = SharedHistory::from_config(&config);
        let notify = NotifySender::new();

        // The first cycle installs the initial (empty) data set.
        assert!(!history.read().is_active());
        run_cycle(&engine, &history, &notify);
        assert!(history.read().is_active());
        assert_eq!(history.read().serial(), Serial::from(0));

        // A second cycle with identical data changes nothing.
        run_cycle(&engine, &history, &notify);
        assert_eq!(history.read().serial(), Serial::from(0));
        assert!(history.read().last_update_done().is_some());
    }

    #[test]
    fn spawn_and_stop_joins_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let config = Config::test_config(dir.path());
        let history = SharedHistory::from_config(&config);
        let daemon = UpdateDaemon::spawn(
            engine, history.clone(), NotifySender::new(),
            Duration::from_secs(3600),
        ).unwrap();
        daemon.stop();
        // The first cycle must have completed before the sleep point.
        assert!(history.read().is_active());
    }
}
