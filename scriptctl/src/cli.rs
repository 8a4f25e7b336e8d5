use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scriptctl")]
#[command(about = "Supervisor for long-running scripts and dev servers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to scriptctl.json in the search paths)
    #[arg(short, long, global = true, env = "SCRIPTCTL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Supervise scripts in the foreground until Ctrl-C
    Run(RunArgs),

    /// List configured scripts
    List(ListArgs),

    /// Run a command once and report its output
    TestRun(TestRunArgs),

    /// View script logs
    Logs(LogsArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    /// Scripts to start in addition to those marked auto_start
    pub scripts: Vec<String>,

    /// Do not start auto_start scripts
    #[arg(long)]
    pub no_auto_start: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Seconds between config file checks
    #[arg(long, default_value = "5")]
    pub reload_interval: u64,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct TestRunArgs {
    /// Script to test, taken from the config
    #[arg(conflicts_with = "exec")]
    pub script: Option<String>,

    /// Ad-hoc command instead of a configured script
    #[arg(short = 'x', long)]
    pub exec: Option<String>,

    /// Arguments for the ad-hoc command
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Working directory
    #[arg(short = 'd', long)]
    pub cwd: Option<PathBuf>,

    /// Environment variables (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Timeout in milliseconds (minimum 1000)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct LogsArgs {
    /// Script name
    pub script: String,

    /// List log files instead of printing one
    #[arg(long)]
    pub list: bool,

    /// Log file to print, as shown by --list
    #[arg(short, long, default_value = "current")]
    pub file: String,

    /// Only print the last N lines
    #[arg(short = 'n', long)]
    pub lines: Option<usize>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_colors: bool,
}
