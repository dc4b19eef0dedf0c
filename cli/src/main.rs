use std::path::PathBuf;

use clap::ArgAction;
use clap::Parser;
use clap::Subcommand;
use intrusion_cli::exec_cmd;
use intrusion_cli::exec_cmd::ExecCli;
use intrusion_cli::logging;
use intrusion_cli::run_cmd;
use intrusion_cli::run_cmd::RunCli;

/// Drive command-line tools from a chat model, one command at a time.
#[derive(Debug, Parser)]
#[command(name = "intrusion", version, subcommand_required = true)]
struct Cli {
    /// Path to config.toml (defaults to $INTRUSION_HOME/config.toml).
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a model-driven engagement against a target.
    Run(RunCli),

    /// Run a single command through the session loop.
    Exec(ExecCli),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run(run_cli) => run_cmd::run(run_cli, config_path).await,
        Command::Exec(exec_cli) => exec_cmd::run(exec_cli, config_path).await,
    }
}
