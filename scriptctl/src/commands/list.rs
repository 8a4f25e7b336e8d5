use crate::cli::ListArgs;
use crate::common;
use scriptctl_core::RestartPolicy;
use std::path::PathBuf;

pub async fn execute(config: Option<PathBuf>, args: ListArgs) -> anyhow::Result<()> {
    let config = common::load_config(config.as_deref()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config.scripts)?);
        return Ok(());
    }

    if config.scripts.is_empty() {
        println!("No scripts configured");
        return Ok(());
    }

    println!(
        "{:<20} {:<6} {:<9} {:<8} COMMAND",
        "ID", "AUTO", "RESTART", "RETRIES"
    );
    for script in &config.scripts {
        let policy = match script.restart_policy {
            RestartPolicy::Always => "always",
            RestartPolicy::OnCrash => "on-crash",
            RestartPolicy::Never => "never",
        };
        let retries = if script.max_retries < 0 {
            "∞".to_string()
        } else {
            script.max_retries.to_string()
        };
        let mut command = script.command.clone();
        if !script.args.is_empty() {
            command.push(' ');
            command.push_str(&script.args.join(" "));
        }

        println!(
            "{:<20} {:<6} {:<9} {:<8} {}",
            script.id.as_str(),
            if script.auto_start { "yes" } else { "no" },
            policy,
            retries,
            command
        );
    }

    Ok(())
}
