use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = waldo_cli::Cli::parse();
    waldo_cli::init_tracing();
    waldo_cli::run_cli(cli)
}
