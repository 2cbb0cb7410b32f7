use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = lms_courseware_cli::Cli::parse();
    lms_courseware_cli::init_tracing(cli.log_format());
    lms_courseware_cli::run_cli(cli)
}
