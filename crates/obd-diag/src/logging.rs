//! Log setup for the command-line tool

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber; logs go to stderr so stdout stays JSON
pub fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a tracing subscriber was already installed");
    }
}
