//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used. It can be created from command line options via
//! [`config_args`][Config::config_args] and
//! [`from_arg_matches`][Config::from_arg_matches].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{App, Arg, ArgMatches};
use log::{error, LevelFilter};
use crate::error::Failed;


//------------ Defaults ------------------------------------------------------

/// The default time between two validation runs in seconds.
const DEFAULT_VALIDATION_INTERVAL: u64 = 3600;

/// The default number of deltas to keep for RTR clients.
const DEFAULT_HISTORY_SIZE: usize = 10;


//------------ Config --------------------------------------------------------

/// The complete configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the directory that contains the local repository copy.
    pub cache_dir: PathBuf,

    /// Path to the directory that contains the trust anchor locators.
    pub tal_dir: PathBuf,

    /// Should we do strict validation?
    pub strict: bool,

    /// Should the TAL URIs be shuffled before each validation run?
    pub shuffle_tal_uris: bool,

    /// The time between two validation runs.
    pub validation_interval: Duration,

    /// How many deltas to keep in the history.
    pub history_size: usize,

    /// The command to run for rsync.
    pub rsync_command: String,

    /// Fall back to cached data when a trust anchor download fails?
    pub local_ta_fallback: bool,

    /// The log level filter for setting up logging.
    pub log_level: LevelFilter,

    /// The target for logging.
    pub log_target: LogTarget,
}

impl Config {
    /// Adds the basic arguments to a clap app.
    ///
    /// Returns the app with the arguments added.
    pub fn config_args<'a: 'b, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
        .arg(Arg::with_name("base-dir")
            .short("b")
            .long("base-dir")
            .value_name("DIR")
            .help("Sets the base directory for cache and TALs")
            .takes_value(true)
        )
        .arg(Arg::with_name("cache-dir")
            .long("cache-dir")
            .value_name("DIR")
            .help("Sets the cache directory")
            .takes_value(true)
        )
        .arg(Arg::with_name("tal-dir")
            .long("tal-dir")
            .value_name("DIR")
            .help("Sets the directory containing the TAL files")
            .takes_value(true)
        )
        .arg(Arg::with_name("strict")
            .long("strict")
            .help("Parse RPKI data in strict mode")
        )
        .arg(Arg::with_name("shuffle-tal-uris")
            .long("shuffle-tal-uris")
            .help("Shuffle the order of the URIs of each TAL")
        )
        .arg(Arg::with_name("validation-interval")
            .long("validation-interval")
            .value_name("SECONDS")
            .help("Seconds between two validation runs")
            .takes_value(true)
        )
        .arg(Arg::with_name("history")
            .long("history")
            .value_name("COUNT")
            .help("Number of deltas to keep for RTR clients")
            .takes_value(true)
        )
        .arg(Arg::with_name("rsync-command")
            .long("rsync-command")
            .value_name("COMMAND")
            .help("The command to run for rsync")
            .takes_value(true)
        )
        .arg(Arg::with_name("local-ta-fallback")
            .long("local-ta-fallback")
            .help("Use cached trust anchor certificates when \
                   downloading fails")
        )
        .arg(Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .multiple(true)
            .help("Print more information")
        )
        .arg(Arg::with_name("quiet")
            .short("q")
            .long("quiet")
            .multiple(true)
            .conflicts_with("verbose")
            .help("Print less information")
        )
        .arg(Arg::with_name("logfile")
            .long("logfile")
            .value_name("PATH")
            .help("Log to this file")
            .takes_value(true)
        )
        .arg(Arg::with_name("syslog")
            .long("syslog")
            .help("Log to syslog")
        )
    }

    /// Creates a configuration from the command line arguments.
    ///
    /// All relative paths are interpreted relative to `cur_dir`.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let base_dir = match matches.value_of("base-dir") {
            Some(dir) => Some(cur_dir.join(dir)),
            None => dirs::home_dir().map(|dir| dir.join(".rpki-cache")),
        };
        let cache_dir = match matches.value_of("cache-dir") {
            Some(dir) => cur_dir.join(dir),
            None => match base_dir {
                Some(ref dir) => dir.join("repository"),
                None => {
                    error!(
                        "Can't determine default working directory. \
                         Please use the -b option."
                    );
                    return Err(Failed)
                }
            }
        };
        let tal_dir = match matches.value_of("tal-dir") {
            Some(dir) => cur_dir.join(dir),
            None => match base_dir {
                Some(ref dir) => dir.join("tals"),
                None => {
                    error!(
                        "Can't determine default working directory. \
                         Please use the -b option."
                    );
                    return Err(Failed)
                }
            }
        };

        Ok(Config {
            cache_dir,
            tal_dir,
            strict: matches.is_present("strict"),
            shuffle_tal_uris: matches.is_present("shuffle-tal-uris"),
            validation_interval: Duration::from_secs(
                Self::from_str_value_of(
                    matches, "validation-interval",
                    DEFAULT_VALIDATION_INTERVAL
                )?
            ),
            history_size: Self::from_str_value_of(
                matches, "history", DEFAULT_HISTORY_SIZE
            )?,
            rsync_command: matches.value_of("rsync-command")
                .unwrap_or("rsync").into(),
            local_ta_fallback: matches.is_present("local-ta-fallback"),
            log_level: {
                match (
                    matches.occurrences_of("verbose"),
                    matches.occurrences_of("quiet")
                ) {
                    (_, 2..=u64::MAX) => LevelFilter::Off,
                    (_, 1) => LevelFilter::Error,
                    (0, _) => LevelFilter::Warn,
                    (1, _) => LevelFilter::Info,
                    _ => LevelFilter::Debug,
                }
            },
            log_target: {
                if matches.is_present("syslog") {
                    LogTarget::Syslog
                }
                else if let Some(file) = matches.value_of("logfile") {
                    LogTarget::File(cur_dir.join(file))
                }
                else {
                    LogTarget::Stderr
                }
            },
        })
    }

    /// Parses an optional argument through `FromStr`.
    ///
    /// Uses `default` if the argument is missing. Logs and errors out if
    /// parsing fails.
    fn from_str_value_of<T: FromStr>(
        matches: &ArgMatches,
        key: &str,
        default: T,
    ) -> Result<T, Failed> {
        match matches.value_of(key) {
            Some(value) => match T::from_str(value) {
                Ok(value) => Ok(value),
                Err(_) => {
                    error!(
                        "Invalid value '{}' for the {} argument.",
                        value, key
                    );
                    Err(Failed)
                }
            }
            None => Ok(default)
        }
    }

    /// Creates a configuration for testing with the given base directory.
    #[cfg(test)]
    pub fn test_config(base: &Path) -> Self {
        Config {
            cache_dir: base.into(),
            tal_dir: base.join("tals"),
            strict: false,
            shuffle_tal_uris: false,
            validation_interval: Duration::from_secs(
                DEFAULT_VALIDATION_INTERVAL
            ),
            history_size: DEFAULT_HISTORY_SIZE,
            rsync_command: "rsync".into(),
            local_ta_fallback: false,
            log_level: LevelFilter::Warn,
            log_target: LogTarget::Stderr,
        }
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogTarget {
    /// Log to standard error.
    Stderr,

    /// Log to the given file.
    File(PathBuf),

    /// Log to syslog.
    ///
    /// On systems without syslog, this is rejected when switching the
    /// logging system over.
    Syslog,
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, Failed> {
        let app = Config::config_args(App::new("test"));
        let mut full = vec!["test"];
        full.extend_from_slice(args);
        let matches = app.get_matches_from_safe(full).unwrap();
        Config::from_arg_matches(&matches, Path::new("/test"))
    }

    #[test]
    fn defaults() {
        let config = parse(&["-b", "base"]).unwrap();
        assert_eq!(config.cache_dir, Path::new("/test/base/repository"));
        assert_eq!(config.tal_dir, Path::new("/test/base/tals"));
        assert!(!config.strict);
        assert!(!config.shuffle_tal_uris);
        assert_eq!(
            config.validation_interval, Duration::from_secs(3600)
        );
        assert_eq!(config.history_size, 10);
        assert_eq!(config.rsync_command, "rsync");
        assert!(!config.local_ta_fallback);
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.log_target, LogTarget::Stderr);
    }

    #[test]
    fn explicit_values() {
        let config = parse(&[
            "-b", "base",
            "--validation-interval", "900",
            "--history", "4",
            "--shuffle-tal-uris",
            "--local-ta-fallback",
            "--logfile", "talus.log",
            "-vv",
        ]).unwrap();
        assert_eq!(
            config.validation_interval, Duration::from_secs(900)
        );
        assert_eq!(config.history_size, 4);
        assert!(config.shuffle_tal_uris);
        assert!(config.local_ta_fallback);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(
            config.log_target,
            LogTarget::File(PathBuf::from("/test/talus.log"))
        );
    }

    #[test]
    fn bad_interval_is_rejected() {
        assert!(
            parse(&["-b", "base", "--validation-interval", "soon"]).is_err()
        );
    }
}
