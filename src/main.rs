use clap::Parser;
use color_eyre::Result;

use chrono::Utc;
use dotenvy::dotenv;
use env_logger::Builder;
use log::LevelFilter;
use mailseal::cli::{run_cli, Cli};
use mailseal::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // load environment variables from .env file, if present
    dotenv().ok();

    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let settings = Settings::from_env()?;
    if let Err(e) = run_cli(cli, settings).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    use std::io::Write;

    Builder::from_default_env()
        .format(move |buf, record| {
            let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(
                buf,
                "[{}] {} [{}] {}",
                ts,
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, level)
        .init();

    Ok(())
}
