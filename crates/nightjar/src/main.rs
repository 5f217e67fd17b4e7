//! Command-line entry point for the nightjar delivery-plane daemon.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![allow(clippy::print_stderr)] // Allowed in this crate only.
#![allow(clippy::print_stdout)] // Allowed in this crate only.
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]

mod cfg;
mod daemon;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tor_rtcompat::{PreferredRuntime, ToplevelBlockOn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cfg::NightjarConfig;

fn main() {
    if let Err(e) = main_main() {
        eprintln!("nightjar: error: {:#}", e);
        std::process::exit(1);
    }
}

/// Inner main, for convenient error handling.
fn main_main() -> Result<()> {
    let matches = Command::new("nightjar")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Delivery and privacy plane for a peer-to-peer E2EE messenger")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .action(ArgAction::Set)
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("FILTER")
                .global(true)
                .action(ArgAction::Set)
                .help("Override the log filter (e.g. 'debug', 'info,nightjar_outbox=trace')"),
        )
        .subcommand(Command::new("run").about("Run the delivery-plane daemon"))
        .subcommand(Command::new("check-config").about("Parse and validate the configuration"))
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => NightjarConfig::load(std::path::Path::new(path))
            .with_context(|| format!("reading configuration from {path}"))?,
        None => NightjarConfig::default(),
    };

    setup_logging(
        matches
            .get_one::<String>("log-level")
            .map(String::as_str)
            .unwrap_or(&config.logging.filter),
    )?;

    match matches.subcommand() {
        Some(("check-config", _)) => {
            config.network_config().context("network section invalid")?;
            println!("configuration OK");
            Ok(())
        }
        Some(("run", _)) => {
            let runtime = PreferredRuntime::create().context("creating async runtime")?;
            let rt = runtime.clone();
            runtime.block_on(daemon::run(rt, config))
        }
        _ => unreachable!("subcommand is required"),
    }
}

/// Install the global tracing subscriber.
fn setup_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    Ok(())
}
