use anyhow::{Context, bail};
use colored::*;
use scriptctl_supervisor::{TestRunInput, TestRunResult, test_run};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::TestRunArgs;
use crate::common;

pub async fn execute(config: Option<PathBuf>, args: TestRunArgs) -> anyhow::Result<()> {
    let mut input = match (&args.script, &args.exec) {
        (Some(name), None) => {
            let id = common::parse_script_id(name)?;
            let config = common::load_config(config.as_deref()).await?;
            let script = config
                .script(&id)
                .with_context(|| format!("Script '{}' not found in config", id))?;
            TestRunInput::from(script)
        }
        (None, Some(command)) => TestRunInput::new(command.as_str()).with_args(args.args.clone()),
        _ => bail!("Pass either a script name or --exec <command>"),
    };

    if let Some(cwd) = args.cwd {
        input.cwd = Some(cwd);
    }
    input.env.extend(common::parse_env(&args.env)?);
    if let Some(ms) = args.timeout {
        input = input.with_timeout(Duration::from_millis(ms));
    }

    let result = test_run(input).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if let Some(error) = &result.error {
        bail!("Test run failed: {}", error);
    }
    if result.timed_out {
        bail!("Test run timed out");
    }
    if result.exit_code != Some(0) {
        bail!("Test run exited with code {:?}", result.exit_code);
    }
    Ok(())
}

fn print_result(result: &TestRunResult) {
    colored::control::set_override(atty::is(atty::Stream::Stdout));

    if !result.stdout.is_empty() {
        println!("{}", "stdout:".green().bold());
        print!("{}", result.stdout);
        if !result.stdout.ends_with('\n') {
            println!();
        }
    }
    if !result.stderr.is_empty() {
        println!("{}", "stderr:".red().bold());
        print!("{}", result.stderr);
        if !result.stderr.ends_with('\n') {
            println!();
        }
    }

    match (result.exit_code, result.timed_out) {
        (_, true) => println!("{}", "timed out".red()),
        (Some(0), _) => println!("{} exit code 0", common::RUNNING_ICON.green()),
        (Some(code), _) => println!("{} exit code {}", common::FAILURE_ICON.red(), code),
        (None, _) => println!("{} no exit code", common::FAILURE_ICON.red()),
    }
}
