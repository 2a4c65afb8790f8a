// ABOUTME: Interactive line-oriented shell over one long-lived supervisor
// ABOUTME: Status changes are printed as they happen; quitting drains active projects

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use inquire::Confirm;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::commands::{App, Commands, Mode};
use crate::display::{self, StatusTracker};

const DEFAULT_LOG_LINES: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "nodefleet", no_binary_name = true, disable_version_flag = true)]
struct SessionLine {
    #[command(subcommand)]
    command: SessionCommand,
}

/// What one line typed into the session asks for
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    #[command(flatten)]
    Intent(Commands),
    /// Show recent activity log entries
    Logs {
        /// Only entries whose message or project contains this text
        filter: Option<String>,
        /// Number of entries to show
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        limit: usize,
    },
    /// Rescan the projects folder
    Rescan,
    /// Leave the session
    #[command(alias = "exit")]
    Quit,
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse_line(line: &str) -> Result<Option<SessionCommand>, clap::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    SessionLine::try_parse_from(line.split_whitespace()).map(|parsed| Some(parsed.command))
}

/// How the session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// `quit` typed: ask before stopping anything
    Requested,
    /// Ctrl-C or end of input: nobody is left to answer a prompt
    Interrupted,
}

fn prompt() {
    print!("{} ", "nodefleet>".cyan().bold());
    let _ = std::io::stdout().flush();
}

pub async fn run_session(app: &App) -> Result<()> {
    println!("{}", "Nodefleet session".blue().bold());
    println!(
        "{}",
        "Type 'help' for commands, 'quit' to leave".dimmed()
    );
    println!();
    app.list().await?;

    let mut tracker = StatusTracker::new();
    tracker.seed(&app.supervisor().registry().snapshot().await);
    let mut events = app.supervisor().subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = tracker.observe(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Status watcher skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let exit = loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break Exit::Interrupted;
            }
        };
        let Some(line) = line else {
            println!();
            break Exit::Interrupted;
        };

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(SessionCommand::Quit)) => break Exit::Requested,
            Ok(Some(SessionCommand::Rescan)) => {
                let count = app.supervisor().rescan().await;
                println!("Found {} project(s)", count.to_string().cyan());
            }
            Ok(Some(SessionCommand::Logs { filter, limit })) => {
                show_logs(app, filter.as_deref(), limit)?;
            }
            Ok(Some(SessionCommand::Intent(command))) => {
                if let Err(e) = app.execute(command, Mode::Background).await {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                }
            }
            Err(e) => {
                let _ = e.print();
            }
        }
    };

    shut_down(app, exit).await;
    watcher.abort();
    Ok(())
}

fn show_logs(app: &App, filter: Option<&str>, limit: usize) -> Result<()> {
    let entries = app.activity().entries(None, filter, Some(limit));
    if app.json() {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", "No log entries".dimmed());
    }
    for entry in &entries {
        println!("{}", display::log_line(entry));
    }
    Ok(())
}

async fn shut_down(app: &App, exit: Exit) {
    let active = app
        .supervisor()
        .registry()
        .snapshot()
        .await
        .into_iter()
        .filter(|r| r.status.is_stoppable())
        .count();
    if active == 0 {
        return;
    }

    let stop = match exit {
        Exit::Interrupted => true,
        Exit::Requested => Confirm::new(&format!(
            "{} project(s) still running. Stop them before quitting?",
            active
        ))
        .with_default(true)
        .prompt()
        .unwrap_or(true),
    };

    if !stop {
        println!("{}", "Leaving running projects alone".yellow());
        return;
    }

    println!("{} Stopping {} project(s)...", "→".cyan(), active);
    let report = app.supervisor().shutdown_drain().await;
    app.report_drain(&report);
}
