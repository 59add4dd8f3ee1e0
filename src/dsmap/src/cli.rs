use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use logger::LevelFilter;

use crate::{config::DsmapConfig, context, script};

pub const LOG_LEVEL_ENV: &str = "DSMAP_LOG_LEVEL";

pub fn cli_main() -> anyhow::Result<()> {
    let matches = Command::new("dsmap")
        .about("Drive a dataspace-backed address space with mmap-style calls")
        .arg(Arg::new("v").multiple_occurrences(true).short('v'))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("JSON file with the address space configuration"),
        )
        .subcommand(
            Command::new("run").arg(
                Arg::new("script")
                    .required(true)
                    .takes_value(true)
                    .help("JSON file with the calls to perform"),
            ),
        )
        .subcommand(Command::new("defaults").about("Print the default configuration"))
        .get_matches();

    let log_level = log_level(matches.occurrences_of("v"));
    logger::init(log_level).map_err(|_| anyhow::anyhow!("failed to set log level"))?;

    let config = match matches.value_of("config") {
        Some(path) => DsmapConfig::load(path)?,
        None => DsmapConfig::default(),
    };

    match matches.subcommand() {
        Some(("run", run)) => cli_run(run, &config),
        Some(("defaults", _)) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        e => anyhow::bail!("unknown subcommand for dsmap {:?}", e),
    }
}

fn log_level(verbosity: u64) -> LevelFilter {
    match verbosity {
        0 => logger::level_from_env(LOG_LEVEL_ENV),
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn cli_run(matches: &ArgMatches, config: &DsmapConfig) -> anyhow::Result<()> {
    let path = matches
        .value_of("script")
        .context("no script given")?;
    let ops = script::load_script(path)?;
    context::init_context(config)
        .map_err(|e| anyhow::anyhow!("failed to initialize the context: {}", e))?;

    for outcome in script::run_script(&ops) {
        println!("{}", serde_json::to_string(&outcome)?);
    }
    logger::debug!(
        "{} dataspaces still live",
        context::context().allocator().stats().live()
    );
    Ok(())
}
