//! Logging.
//!
//! All diagnostic output is done via logging, never to stderr directly.
//! Logging is initialized early via [`init`] so that configuration errors
//! can already be reported. Once the configuration has been loaded,
//! [`switch_logging`] moves logging over to whatever target the user asked
//! for.

use std::io;
use log::LevelFilter;
use crate::config::{Config, LogTarget};
use crate::error::Failed;


//------------ init ----------------------------------------------------------

/// Initializes logging.
///
/// Until the configuration is available, logging goes to stderr with a
/// maximum level of warn.
pub fn init() -> Result<(), Failed> {
    if log_reroute::init().is_err() {
        eprintln!("Failed to initialize logger. Aborting.");
        return Err(Failed)
    }
    log::set_max_level(LevelFilter::Warn);
    log_reroute::reroute_boxed(
        fern::Dispatch::new().chain(io::stderr()).into_log().1
    );
    Ok(())
}


//------------ switch_logging ------------------------------------------------

/// Switches logging to the target given by the configuration.
pub fn switch_logging(config: &Config) -> Result<(), Failed> {
    let logger = match config.log_target {
        LogTarget::Stderr => {
            dispatch(config, false).chain(io::stderr())
        }
        LogTarget::File(ref path) => {
            let file = match fern::log_file(path) {
                Ok(file) => file,
                Err(err) => {
                    log::error!(
                        "Failed to open log file '{}': {}",
                        path.display(), err
                    );
                    return Err(Failed)
                }
            };
            dispatch(config, true).chain(file)
        }
        LogTarget::Syslog => {
            return switch_syslog(config)
        }
    };
    log_reroute::reroute_boxed(logger.into_log().1);
    log::set_max_level(config.log_level);
    Ok(())
}

/// Creates the basic dispatch for the given config.
///
/// Filters out the noise of the libraries underneath the HTTPS client:
/// they use debug and trace rather generously.
fn dispatch(config: &Config, timestamp: bool) -> fern::Dispatch {
    let res = fern::Dispatch::new()
        .level(config.log_level)
        .level_for("rustls", LevelFilter::Error)
        .level_for("reqwest", LevelFilter::Info)
        .level_for("hyper", LevelFilter::Info)
        .level_for("h2", LevelFilter::Info);
    if timestamp {
        res.format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                message
            ))
        })
    }
    else {
        res.format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
    }
}

/// Switches logging over to syslog.
#[cfg(unix)]
fn switch_syslog(config: &Config) -> Result<(), Failed> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: String::from("talus"),
        pid: std::process::id() as _,
    };
    let logger = match syslog::unix(formatter) {
        Ok(logger) => logger,
        Err(err) => {
            log::error!("Cannot connect to syslog: {}", err);
            return Err(Failed)
        }
    };
    log_reroute::reroute_boxed(
        dispatch(config, false).chain(
            Box::new(syslog::BasicLogger::new(logger)) as Box<dyn log::Log>
        ).into_log().1
    );
    log::set_max_level(config.log_level);
    Ok(())
}

/// Refuses syslog on systems that don’t have it.
#[cfg(not(unix))]
fn switch_syslog(_config: &Config) -> Result<(), Failed> {
    log::error!("Syslog logging is not available on this system.");
    Err(Failed)
}
