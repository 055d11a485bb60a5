//! The talus binary.

use std::env::current_dir;
use std::process::exit;
use clap::{crate_version, App};
use log::error;
use talus::config::Config;
use talus::error::ExitError;
use talus::operation::Operation;

// Since `main` with a result insists on printing a message, but in our
// case everything has been logged when we get an error, we use our own,
// more quiet version.
fn _main() -> Result<(), ExitError> {
    talus::log::init()?;
    let cur_dir = match current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            error!(
                "Fatal: cannot get current directory ({}). Aborting.",
                err
            );
            return Err(ExitError::Generic);
        }
    };
    let matches = Operation::config_args(Config::config_args(
        App::new("talus")
            .version(crate_version!())
            .about("collects and validates RPKI repository data")
    )).get_matches();
    let config = Config::from_arg_matches(&matches, &cur_dir)?;
    let operation = Operation::from_arg_matches(&matches, &cur_dir)?;
    operation.run(config)
}

fn main() {
    match _main() {
        Ok(_) => exit(0),
        Err(err) => exit(err.exit_status()),
    }
}
