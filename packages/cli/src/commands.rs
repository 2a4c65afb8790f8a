// ABOUTME: Command line surface and the handlers that turn each intent into supervisor calls
// ABOUTME: Shared by one-shot invocations (which wait for the outcome) and the interactive session

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use colored::*;
use futures::future::join_all;
use inquire::Confirm;
use nodefleet_core::is_long_running_script;
use nodefleet_supervisor::{
    ActivityLog, AppRecord, AppStatus, DrainReport, RestartOutcome, Supervisor, SupervisorConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CliConfig;
use crate::display;

#[derive(Parser, Debug)]
#[command(name = "nodefleet")]
#[command(about = "Nodefleet - run, install and supervise a folder of Node.js projects")]
#[command(version)]
pub struct Cli {
    /// Folder whose immediate subfolders are the projects
    #[arg(long, global = true, value_name = "DIR")]
    pub projects_dir: Option<PathBuf>,

    /// Print JSON instead of tables and colored text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Every user intent. Projects are referenced by manifest name, folder name or path.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List projects with status, port, PID and git state
    List,
    /// Start a project and supervise it until it exits or Ctrl-C
    Start { project: String },
    /// Stop a running project
    Stop { project: String },
    /// Stop a running project and start it again
    Restart { project: String },
    /// Run `npm install`
    Install { project: String },
    /// Run `npm update`
    Update { project: String },
    /// Run `npm audit`
    Audit { project: String },
    /// Run a script from package.json
    Run { project: String, script: String },
    /// Remove node_modules
    Clean {
        project: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete the project folder
    Delete {
        project: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Stop the project first if it is running
        #[arg(long)]
        stop_first: bool,
    },
    /// Stop every running project
    StopAll {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Create a basic project with a runnable HTTP server
    Create { name: String },
    /// Re-read a project's package.json
    Reload { project: String },
    /// Show or change the saved configuration
    Config {
        /// Save a new projects folder
        #[arg(long, value_name = "DIR")]
        set_projects_dir: Option<PathBuf>,
    },
    /// Interactive shell with live status updates
    Session,
}

/// How long a handler stays with the action it started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Wait for the outcome; long-running processes are supervised until Ctrl-C
    Foreground,
    /// Return as soon as the action is accepted
    Background,
}

/// Load the saved settings, or update them when a new folder is given.
///
/// Works without a supervisor so a missing projects folder can be fixed.
pub fn handle_config(
    config: &mut CliConfig,
    set_projects_dir: Option<&Path>,
    projects_root: &Path,
    json: bool,
) -> Result<()> {
    if let Some(dir) = set_projects_dir {
        let saved = config.set_projects_dir(dir)?;
        if json {
            println!("{}", serde_json::json!({ "projects_folder": saved }));
        } else {
            println!(
                "{} Projects folder set to {}",
                "✓".green().bold(),
                saved.display().to_string().cyan()
            );
        }
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "settings_file": config.settings_path,
                "projects_folder": projects_root,
                "settings": config.settings,
            })
        );
    } else {
        println!("{} {}", "Settings file:".cyan(), config.settings_path.display());
        println!("{} {}", "Projects folder:".cyan(), projects_root.display());
        if let Some(theme) = &config.settings.theme {
            println!("{} {}", "Theme:".cyan(), theme);
        }
    }
    Ok(())
}

/// Supervisor plus presentation state for one CLI run
pub struct App {
    supervisor: Supervisor,
    log: Arc<ActivityLog>,
    settings_path: PathBuf,
    json: bool,
}

impl App {
    pub fn new(
        supervisor: Supervisor,
        log: Arc<ActivityLog>,
        settings_path: PathBuf,
        json: bool,
    ) -> Self {
        Self {
            supervisor,
            log,
            settings_path,
            json,
        }
    }

    /// Build a supervisor for `projects_root` and run the first scan.
    ///
    /// # Errors
    ///
    /// Fails when the projects folder does not exist.
    pub async fn bootstrap(projects_root: PathBuf, settings_path: PathBuf, json: bool) -> Result<Self> {
        if !projects_root.is_dir() {
            bail!(
                "Projects folder not found: {}. Set one with 'nodefleet config --set-projects-dir <DIR>'",
                projects_root.display()
            );
        }

        let log = Arc::new(ActivityLog::new());
        let supervisor = Supervisor::new(SupervisorConfig::from_env(projects_root), log.clone());
        let count = supervisor.rescan().await;
        debug!("Initial scan found {} project(s)", count);

        Ok(Self::new(supervisor, log, settings_path, json))
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.log
    }

    pub fn json(&self) -> bool {
        self.json
    }

    async fn resolve(&self, query: &str) -> Result<AppRecord> {
        self.supervisor
            .find(query)
            .await
            .ok_or_else(|| anyhow!("No project matches '{}'. Try 'nodefleet list'", query))
    }

    async fn current(&self, path: &Path) -> Option<AppRecord> {
        self.supervisor.registry().read(path).await
    }

    fn emit_record(&self, record: &AppRecord) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(record)?);
        } else {
            println!("{}", display::record_line(record));
        }
        Ok(())
    }

    fn accepted(&self, record: &AppRecord, what: &str) {
        if !self.json {
            println!("{} {} '{}'", "→".cyan(), what, record.name);
        }
    }

    /// Dispatch one intent.
    pub async fn execute(&self, command: Commands, mode: Mode) -> Result<()> {
        match command {
            Commands::List => self.list().await,
            Commands::Start { project } => self.start(&project, mode).await,
            Commands::Stop { project } => self.stop(&project, mode).await,
            Commands::Restart { project } => self.restart(&project, mode).await,
            Commands::Install { project } => {
                let record = self.resolve(&project).await?;
                let handle = self.supervisor.install_deps(&record.path).await?;
                self.finish(&record, handle, mode, "Installing dependencies for").await
            }
            Commands::Update { project } => {
                let record = self.resolve(&project).await?;
                let handle = self.supervisor.update_deps(&record.path).await?;
                self.finish(&record, handle, mode, "Updating dependencies for").await
            }
            Commands::Audit { project } => {
                let record = self.resolve(&project).await?;
                let handle = self.supervisor.audit_deps(&record.path).await?;
                self.finish(&record, handle, mode, "Auditing").await
            }
            Commands::Run { project, script } => self.run_script(&project, &script, mode).await,
            Commands::Clean { project, yes } => self.clean(&project, yes, mode).await,
            Commands::Delete {
                project,
                yes,
                stop_first,
            } => self.delete(&project, yes, stop_first, mode).await,
            Commands::StopAll { yes } => self.stop_all(yes, mode).await,
            Commands::Create { name } => self.create(&name).await,
            Commands::Reload { project } => {
                let record = self.resolve(&project).await?;
                let record = self.supervisor.reload_manifest(&record.path).await?;
                self.emit_record(&record)
            }
            Commands::Config { set_projects_dir } => {
                let mut config = CliConfig::load_from(self.settings_path.clone());
                handle_config(
                    &mut config,
                    set_projects_dir.as_deref(),
                    &self.supervisor.config().projects_root,
                    self.json,
                )?;
                if set_projects_dir.is_some() && !self.json {
                    println!("{}", "The new folder is used from the next launch".dimmed());
                }
                Ok(())
            }
            Commands::Session => bail!("Already in a session"),
        }
    }

    pub async fn list(&self) -> Result<()> {
        let records = self.supervisor.registry().snapshot().await;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            display::print_records(&records);
        }
        Ok(())
    }

    async fn start(&self, project: &str, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        let handle = self.supervisor.start_project(&record.path).await?;
        match mode {
            Mode::Foreground => self.supervise(&record, handle).await,
            Mode::Background => {
                self.accepted(&record, "Starting");
                Ok(())
            }
        }
    }

    async fn stop(&self, project: &str, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        let signal = self.supervisor.stop_project(&record.path).await?;
        if mode == Mode::Background {
            self.accepted(&record, "Stopping");
            return Ok(());
        }

        let settled = signal.wait().await;
        if let Some(current) = self.current(&record.path).await {
            self.emit_record(&current)?;
        }
        match settled {
            AppStatus::Stopped | AppStatus::Stopping => Ok(()),
            other => bail!("Could not stop '{}': {}", record.name, other),
        }
    }

    async fn restart(&self, project: &str, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        if mode == Mode::Background {
            // The stop half can take seconds; keep the prompt responsive
            let supervisor = self.supervisor.clone();
            let path = record.path.clone();
            self.accepted(&record, "Restarting");
            tokio::spawn(async move {
                if let Err(e) = supervisor.restart_project(&path).await {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                }
            });
            return Ok(());
        }

        match self.supervisor.restart_project(&record.path).await? {
            RestartOutcome::Started(handle) => self.supervise(&record, handle).await,
            RestartOutcome::StopFailed(status) => {
                bail!("Restart of '{}' aborted: stop ended in {}", record.name, status)
            }
        }
    }

    async fn run_script(&self, project: &str, script: &str, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        let handle = self.supervisor.run_script(&record.path, script).await?;
        if mode == Mode::Foreground && is_long_running_script(script) {
            return self.supervise(&record, handle).await;
        }
        self.finish(&record, handle, mode, &format!("Running '{}' for", script))
            .await
    }

    async fn clean(&self, project: &str, yes: bool, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        let prompt = format!("Remove node_modules of '{}'?", record.name);
        if !confirm(&prompt, yes)? {
            println!("{}", "Operation cancelled".yellow());
            return Ok(());
        }

        let handle = self.supervisor.clean_deps(&record.path).await?;
        self.finish(&record, handle, mode, "Cleaning").await
    }

    async fn delete(&self, project: &str, yes: bool, stop_first: bool, mode: Mode) -> Result<()> {
        let record = self.resolve(project).await?;
        let prompt = format!(
            "Permanently delete '{}' ({})?",
            record.name,
            record.path.display()
        );
        if !confirm(&prompt, yes)? {
            println!("{}", "Operation cancelled".yellow());
            return Ok(());
        }

        let handle = self
            .supervisor
            .delete_project(&record.path, stop_first)
            .await?;
        if mode == Mode::Background {
            self.accepted(&record, "Deleting");
            return Ok(());
        }

        handle.await?;
        match self.current(&record.path).await {
            None => {
                if self.json {
                    println!("{}", serde_json::json!({ "deleted": record.path }));
                } else {
                    println!("{} Deleted '{}'", "✓".green().bold(), record.name);
                }
                Ok(())
            }
            Some(current) => {
                self.emit_record(&current)?;
                bail!("'{}' was not deleted ({})", current.name, current.status)
            }
        }
    }

    async fn stop_all(&self, yes: bool, mode: Mode) -> Result<()> {
        let active = self
            .supervisor
            .registry()
            .snapshot()
            .await
            .into_iter()
            .filter(|r| r.status.is_stoppable())
            .count();
        if active == 0 {
            if !self.json {
                println!("{}", "No running projects".yellow());
            }
            return Ok(());
        }

        if !confirm(&format!("Stop {} running project(s)?", active), yes)? {
            println!("{}", "Operation cancelled".yellow());
            return Ok(());
        }

        let signals = self.supervisor.stop_all().await;
        if mode == Mode::Background {
            if !self.json {
                println!("{} Stopping {} project(s)", "→".cyan(), signals.len());
            }
            return Ok(());
        }

        let (paths, signals): (Vec<PathBuf>, Vec<_>) = signals.into_iter().unzip();
        let settled = join_all(signals.into_iter().map(|s| s.wait())).await;

        let mut failed = 0;
        for (path, status) in paths.iter().zip(settled) {
            if status != AppStatus::Stopped {
                failed += 1;
            }
            if let Some(record) = self.current(path).await {
                self.emit_record(&record)?;
            }
        }

        if failed > 0 {
            bail!("Stopped {} project(s), {} failed", paths.len() - failed, failed);
        }
        Ok(())
    }

    async fn create(&self, name: &str) -> Result<()> {
        let path = self.supervisor.create_basic_project(name).await?;
        match self.current(&path).await {
            Some(record) if self.json => self.emit_record(&record),
            _ => {
                println!(
                    "{} Created {}",
                    "✓".green().bold(),
                    path.display().to_string().cyan()
                );
                println!(
                    "{}",
                    "Run 'nodefleet install <name>' once, then 'nodefleet start <name>'".dimmed()
                );
                Ok(())
            }
        }
    }

    /// Wait for a one-shot action; background mode returns right away.
    async fn finish(
        &self,
        record: &AppRecord,
        handle: JoinHandle<()>,
        mode: Mode,
        what: &str,
    ) -> Result<()> {
        if mode == Mode::Background {
            self.accepted(record, what);
            return Ok(());
        }

        handle.await?;
        let current = self
            .current(&record.path)
            .await
            .ok_or_else(|| anyhow!("'{}' disappeared while running", record.name))?;
        self.emit_record(&current)?;
        if current.status.is_error() {
            bail!("'{}' ended in {}", current.name, current.status);
        }
        Ok(())
    }

    /// Stay with a long-running process until it exits or Ctrl-C, then drain.
    async fn supervise(&self, record: &AppRecord, handle: JoinHandle<()>) -> Result<()> {
        if !self.json {
            println!(
                "{} Supervising '{}'. Press Ctrl-C to stop.",
                "→".cyan(),
                record.name
            );
        }

        tokio::select! {
            _ = handle => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping '{}'", record.name);
            }
        }

        let report = self.supervisor.drain_owned().await;
        self.report_drain(&report);

        let current = self.current(&record.path).await;
        if let Some(current) = &current {
            self.emit_record(current)?;
        }
        if !report.is_clean() {
            bail!("{} project(s) did not stop cleanly", report.failed.len());
        }
        match current {
            Some(current) if current.status.is_error() => {
                bail!("'{}' ended in {}", current.name, current.status)
            }
            _ => Ok(()),
        }
    }

    pub fn report_drain(&self, report: &DrainReport) {
        if self.json || (report.confirmed.is_empty() && report.failed.is_empty()) {
            return;
        }
        println!(
            "{} Stopped {} project(s)",
            "✓".green().bold(),
            report.confirmed.len()
        );
        for path in &report.failed {
            println!(
                "{} {} did not confirm stop",
                "✗".red().bold(),
                path.display()
            );
        }
    }
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::new(prompt).with_default(false).prompt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nodefleet").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_flags_anywhere() {
        let cli = parse(&["list", "--json", "--projects-dir", "/srv/apps"]);
        assert!(cli.json);
        assert_eq!(cli.projects_dir, Some(PathBuf::from("/srv/apps")));
        assert_eq!(cli.command, Commands::List);
    }

    #[rstest]
    #[case(&["start", "web"], Commands::Start { project: "web".into() })]
    #[case(&["run", "web", "dev"], Commands::Run { project: "web".into(), script: "dev".into() })]
    #[case(&["delete", "web", "-y", "--stop-first"], Commands::Delete { project: "web".into(), yes: true, stop_first: true })]
    #[case(&["clean", "web"], Commands::Clean { project: "web".into(), yes: false })]
    #[case(&["stop-all", "--yes"], Commands::StopAll { yes: true })]
    #[case(&["config", "--set-projects-dir", "~/code"], Commands::Config { set_projects_dir: Some(PathBuf::from("~/code")) })]
    fn test_subcommands_parse(#[case] args: &[&str], #[case] expected: Commands) {
        assert_eq!(parse(args).command, expected);
    }

    #[test]
    fn test_project_argument_required() {
        assert!(Cli::try_parse_from(["nodefleet", "start"]).is_err());
        assert!(Cli::try_parse_from(["nodefleet", "run", "web"]).is_err());
    }

    #[test]
    fn test_confirm_skipped_with_yes() {
        assert!(confirm("never shown", true).unwrap());
    }
}
