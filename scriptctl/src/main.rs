mod cli;
mod commands;
mod common;
mod telemetry;

use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // `run` installs its own subscriber once the logs directory is known
    if !matches!(cli.command, cli::Command::Run(_)) {
        telemetry::init_stderr();
    }

    match cli.command {
        cli::Command::Run(args) => commands::run::execute(cli.config, args).await,
        cli::Command::List(args) => commands::list::execute(cli.config, args).await,
        cli::Command::TestRun(args) => commands::test_run::execute(cli.config, args).await,
        cli::Command::Logs(args) => commands::logs::execute(cli.config, args).await,
    }
}
