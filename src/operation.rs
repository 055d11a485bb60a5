//! The commands of the binary.
//!
//! This module contains the type [`Operation`] with one variant per
//! command the binary understands, the command line definitions that go
//! with them, and the code to actually run them.

use std::thread;
use std::path::{Path, PathBuf};
use clap::{App, Arg, ArgMatches, SubCommand};
use log::error;
use rpki::rtr::server::NotifySender;
use crate::config::Config;
use crate::daemon::UpdateDaemon;
use crate::engine::Engine;
use crate::error::{ExitError, Failed};
use crate::output::OutputFormat;
use crate::payload::{PayloadSnapshot, SharedHistory};


//------------ Operation -----------------------------------------------------

/// The command to run.
pub enum Operation {
    /// Produce the current set of VRPs and exit.
    Vrps {
        /// The destination to output the data to.
        ///
        /// If this is `None`, we are supposed to output to stdout.
        output: Option<PathBuf>,

        /// The desired output format.
        format: OutputFormat,
    },

    /// Run validation periodically until the process is terminated.
    Server,
}

impl Operation {
    /// Adds the command configuration to a clap app.
    pub fn config_args<'a: 'b, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
        .subcommand(SubCommand::with_name("vrps")
            .about("Produces a list of validated ROA payloads")
            .arg(Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("FILE")
                .help("Output file, '-' or not present for stdout")
                .default_value("-")
                .takes_value(true)
            )
            .arg(Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .possible_values(OutputFormat::NAMES)
                .default_value("csv")
                .help("Sets the output format")
                .takes_value(true)
            )
        )
        .subcommand(SubCommand::with_name("server")
            .about("Runs periodic validation until terminated")
        )
    }

    /// Creates the operation from the command line arguments.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        match matches.subcommand() {
            ("vrps", Some(matches)) => {
                Ok(Operation::Vrps {
                    output: match matches.value_of("output") {
                        None | Some("-") => None,
                        Some(path) => Some(cur_dir.join(path)),
                    },
                    format: match matches.value_of("format")
                        .and_then(OutputFormat::from_name)
                    {
                        Some(format) => format,
                        // This is covered by clap above.
                        None => unreachable!(),
                    },
                })
            }
            ("server", _) => Ok(Operation::Server),
            _ => {
                error!(
                    "No valid command given. See 'talus --help' for a list."
                );
                Err(Failed)
            }
        }
    }

    /// Runs the command.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        crate::log::switch_logging(&config)?;
        match self {
            Operation::Vrps { output, format } => {
                Self::vrps(config, output, format)
            }
            Operation::Server => Self::server(config),
        }
    }

    /// Performs one validation run and outputs the result.
    fn vrps(
        config: Config,
        output: Option<PathBuf>,
        format: OutputFormat,
    ) -> Result<(), ExitError> {
        Engine::init(&config)?;
        let engine = Engine::new(&config)?;
        let (report, mut metrics) = engine.process_payload().map_err(|_| {
            ExitError::IncompleteUpdate
        })?;
        let snapshot = PayloadSnapshot::from_report(report, &mut metrics);
        format.output(&snapshot, output.as_deref())?;
        Ok(())
    }

    /// Runs the update daemon until the process is terminated.
    fn server(config: Config) -> Result<(), ExitError> {
        Engine::init(&config)?;
        let engine = Engine::new(&config)?;
        let history = SharedHistory::from_config(&config);
        let notify = NotifySender::new();
        let interval = config.validation_interval;
        let _daemon = UpdateDaemon::spawn(
            engine, history, notify, interval
        )?;

        // All the work happens on the daemon thread. This thread has
        // nothing left to do until the service manager terminates the
        // process.
        loop {
            thread::park()
        }
    }
}
