use crate::cli::LogsArgs;
use crate::common;
use colored::*;
use scriptctl_logging::{LogConfig, LogManager, LogMeta};
use std::path::PathBuf;

pub async fn execute(config: Option<PathBuf>, args: LogsArgs) -> anyhow::Result<()> {
    let use_colors = !args.no_colors && atty::is(atty::Stream::Stdout);
    colored::control::set_override(use_colors);

    let config = common::load_config(config.as_deref()).await?;
    let id = common::parse_script_id(&args.script)?;
    let logs = LogManager::new(LogConfig::from_settings(&config.settings));

    if args.list {
        let files = logs.list(&id).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&files)?);
        } else {
            display_files(&id.to_string(), &files);
        }
        return Ok(());
    }

    let mut content = logs.read(&id, &args.file).await?;
    if let Some(n) = args.lines {
        content = common::last_lines(&content, n);
    }

    if args.json {
        let data = serde_json::json!({
            "script": id.as_str(),
            "file": args.file,
            "content": content,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else if content.is_empty() {
        println!("{}", format!("No logs for {}", id).yellow());
    } else {
        print!("{}", content);
        if !content.ends_with('\n') {
            println!();
        }
    }

    Ok(())
}

fn display_files(script: &str, files: &[LogMeta]) {
    if files.is_empty() {
        println!("{}", format!("No log files for {}", script).yellow());
        return;
    }

    println!("{}", format!("=== {} ===", script).bold().cyan());
    for meta in files {
        println!(
            "{:<24} {:>10}  {}",
            meta.file,
            common::format_bytes(meta.size),
            common::format_epoch_ms(meta.mtime_ms).dimmed()
        );
    }
}
