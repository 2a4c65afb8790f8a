// ABOUTME: Terminal rendering of project records, status changes and activity log entries
// ABOUTME: Tables use comfy-table; colors come from the status variant, never from its text

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use nodefleet_supervisor::{AppRecord, AppStatus, LogEntry, LogLevel, RegistryEvent, VcsDirty};
use std::collections::HashMap;
use std::path::PathBuf;

/// Color a status for terminal output
pub fn colored_status(status: &AppStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        AppStatus::Running | AppStatus::RunningScript(_) => text.green().bold(),
        AppStatus::Error(_) => text.red().bold(),
        AppStatus::NotInstalled => text.yellow(),
        s if s.is_busy() => text.cyan(),
        _ => text.normal(),
    }
}

fn dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn vcs_text(record: &AppRecord) -> String {
    match record.vcs.dirty {
        VcsDirty::Dirty => format!("{} *", record.vcs.branch),
        _ => record.vcs.branch.to_string(),
    }
}

/// Project table, sorted by name
pub fn records_table(records: &[AppRecord]) -> Table {
    let mut sorted: Vec<&AppRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.name.to_lowercase());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Name", "Status", "Port", "PID", "Deps", "Git", "Folder"]);

    for record in sorted {
        table.add_row(vec![
            record.name.clone(),
            colored_status(&record.status).to_string(),
            dash(record.port),
            dash(record.pid),
            if record.installed { "yes" } else { "no" }.to_string(),
            vcs_text(record),
            record.dir_name(),
        ]);
    }

    table
}

pub fn print_records(records: &[AppRecord]) {
    if records.is_empty() {
        println!("{}", "No projects found".yellow());
        println!(
            "{}",
            "Each project is a folder with a package.json directly under the projects folder"
                .dimmed()
        );
        return;
    }

    println!("{}", records_table(records));
    let running = records.iter().filter(|r| r.status.is_live()).count();
    println!(
        "Total: {} projects, {} running",
        records.len().to_string().cyan(),
        running.to_string().green()
    );
}

/// Single-record summary printed after an action settles
pub fn record_line(record: &AppRecord) -> String {
    let mut line = format!("{} {}", record.name.bold(), colored_status(&record.status));
    if let Some(port) = record.port {
        line.push_str(&format!(" on port {}", port.to_string().cyan()));
    }
    if let Some(pid) = record.pid {
        line.push_str(&format!(" (PID {})", pid));
    }
    line
}

pub fn log_line(entry: &LogEntry) -> String {
    let time = entry
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string();
    let level = match entry.level {
        LogLevel::Info => "INFO".blue(),
        LogLevel::Warning => "WARN".yellow(),
        LogLevel::Error => "ERROR".red().bold(),
    };
    match &entry.project {
        Some(project) => format!("{} {} [{}] {}", time.dimmed(), level, project, entry.message),
        None => format!("{} {} {}", time.dimmed(), level, entry.message),
    }
}

/// Turns registry notifications into one line per status change.
///
/// Updates that leave the status alone (a port detected, a PID stored) are
/// folded away so the session output stays readable.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: HashMap<PathBuf, AppStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with the current snapshot so existing states are not reported
    pub fn seed(&mut self, records: &[AppRecord]) {
        for record in records {
            self.last.insert(record.path.clone(), record.status.clone());
        }
    }

    pub fn observe(&mut self, event: &RegistryEvent) -> Option<String> {
        match event {
            RegistryEvent::Updated(record) => {
                let previous = self.last.insert(record.path.clone(), record.status.clone());
                if previous.as_ref() == Some(&record.status) {
                    return None;
                }
                Some(format!("{} {}", "»".dimmed(), record_line(record)))
            }
            RegistryEvent::Removed(path) => {
                self.last.remove(path);
                Some(format!("{} removed {}", "»".dimmed(), path.display()))
            }
            RegistryEvent::Rescanned(_) => None,
        }
    }
}
