use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

const DEFAULT_ITEMS: usize = 10;

fn main() {
    init_logging();

    let options = match parse_args(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(2);
        }
    };

    if let Err(err) = reelfeed::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("REELFEED_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns `None` when a flag was handled and the program should exit.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Option<reelfeed::RunOptions>> {
    let mut options = reelfeed::RunOptions {
        config_file: None,
        items: DEFAULT_ITEMS,
    };
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("reelfeed {}", reelfeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!(
                    "reelfeed: simulated short-video feed session.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --config <path>      Read configuration from <path>\n  --items <n>          Number of clips to seed (default {DEFAULT_ITEMS})\n\nSet REELFEED_LOG (e.g. REELFEED_LOG=debug) to control logging."
                );
                return Ok(None);
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                options.config_file = Some(PathBuf::from(path));
            }
            "--items" => {
                let value = args.next().context("--items needs a number")?;
                options.items = value
                    .parse()
                    .with_context(|| format!("invalid --items value {value:?}"))?;
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(Some(options))
}
