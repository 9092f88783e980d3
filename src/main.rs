use anyhow::Context;
use clap::Parser;
use pos_db_health::{logging, run_headless, CancelAllDecisions, HealthConfig, PlatformPathProvider};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pos-db-health", version)]
#[command(
    about = "Check, migrate and if necessary repair the POS database, then print a JSON report",
    long_about = None
)]
struct Args {
    /// Never replace an unusable database; stop instead of starting fresh
    #[arg(long)]
    keep_data: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let _guard = logging::init_logging(&logging::get_log_dir());

    let config = HealthConfig::from_env();
    let paths = PlatformPathProvider::from_env();
    let (report, ready) = if args.keep_data {
        run_headless(&config, &paths, Some(&CancelAllDecisions))
    } else {
        run_headless(&config, &paths, None)
    };

    let out = serde_json::to_string_pretty(&report).context("serialize report")?;
    println!("{out}");

    Ok(if ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_data_flag() {
        assert!(!Args::try_parse_from(["pos-db-health"]).unwrap().keep_data);
        assert!(Args::try_parse_from(["pos-db-health", "--keep-data"]).unwrap().keep_data);
        assert!(Args::try_parse_from(["pos-db-health", "--bogus"]).is_err());
    }
}
