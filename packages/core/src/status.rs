// ABOUTME: Application status state machine and the lifecycle actions that drive it
// ABOUTME: Busy/live/stoppable predicates are computed from the variant, never from display strings

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which operation a terminal error status belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Install,
    Start,
    Stop,
    Manifest,
    NoStartTarget,
    Delete,
    Clean,
    Script,
    Audit,
    Update,
    /// The executable itself could not be found
    Command,
    /// Anything unexpected during spawn, read or wait
    Exception,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Install => "Install",
            ErrorKind::Start => "Start",
            ErrorKind::Stop => "Stop",
            ErrorKind::Manifest => "Manifest",
            ErrorKind::NoStartTarget => "No Start Target",
            ErrorKind::Delete => "Delete",
            ErrorKind::Clean => "Clean",
            ErrorKind::Script => "Script",
            ErrorKind::Audit => "Audit",
            ErrorKind::Update => "Update",
            ErrorKind::Command => "Command",
            ErrorKind::Exception => "Exception",
        }
    }
}

/// Current state of an application record.
///
/// Interim (busy) states end in `...` when displayed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum AppStatus {
    #[default]
    Unknown,
    NotInstalled,
    Installed,
    Starting,
    Running,
    /// A long-running script such as `dev` or `watch`
    RunningScript(String),
    /// Interim form of `RunningScript` while the command is still starting
    RunningScriptStarting(String),
    Stopping,
    Stopped,
    Installing,
    Cleaning,
    Deleting,
    Auditing,
    UpdatingDeps,
    Error(ErrorKind),
}

impl AppStatus {
    /// Interim status: lifecycle actions other than stop are rejected while busy.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            AppStatus::Starting
                | AppStatus::RunningScriptStarting(_)
                | AppStatus::Stopping
                | AppStatus::Installing
                | AppStatus::Cleaning
                | AppStatus::Deleting
                | AppStatus::Auditing
                | AppStatus::UpdatingDeps
        )
    }

    /// An active, user-visible, potentially listening process.
    pub fn is_live(&self) -> bool {
        matches!(self, AppStatus::Running | AppStatus::RunningScript(_))
    }

    /// Statuses the termination protocol recognizes as stoppable.
    pub fn is_stoppable(&self) -> bool {
        self.is_live() || matches!(self, AppStatus::Starting | AppStatus::RunningScriptStarting(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AppStatus::Error(_))
    }

    /// Idle status a record falls back to when nothing is running.
    pub fn idle(installed: bool) -> Self {
        if installed {
            AppStatus::Installed
        } else {
            AppStatus::NotInstalled
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Unknown => write!(f, "Unknown"),
            AppStatus::NotInstalled => write!(f, "Not Installed"),
            AppStatus::Installed => write!(f, "Installed"),
            AppStatus::Starting => write!(f, "Starting..."),
            AppStatus::Running => write!(f, "Running"),
            AppStatus::RunningScript(name) => write!(f, "Running Script: {}", name),
            AppStatus::RunningScriptStarting(name) => write!(f, "Running Script: {}...", name),
            AppStatus::Stopping => write!(f, "Stopping..."),
            AppStatus::Stopped => write!(f, "Stopped"),
            AppStatus::Installing => write!(f, "Installing..."),
            AppStatus::Cleaning => write!(f, "Cleaning..."),
            AppStatus::Deleting => write!(f, "Deleting..."),
            AppStatus::Auditing => write!(f, "Auditing..."),
            AppStatus::UpdatingDeps => write!(f, "Updating Deps..."),
            AppStatus::Error(kind) => write!(f, "Error ({})", kind.as_str()),
        }
    }
}

/// A lifecycle action the command executor can run against a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Install,
    Update,
    Audit,
    RunScript(String),
}

impl Action {
    /// Human label used in log lines
    pub fn label(&self) -> String {
        match self {
            Action::Start => "Start".to_string(),
            Action::Install => "Install".to_string(),
            Action::Update => "Update".to_string(),
            Action::Audit => "Audit".to_string(),
            Action::RunScript(name) => format!("Run Script: {}", name),
        }
    }

    /// Busy status set synchronously when the action is accepted
    pub fn interim_status(&self) -> AppStatus {
        match self {
            Action::Start => AppStatus::Starting,
            Action::Install => AppStatus::Installing,
            Action::Update => AppStatus::UpdatingDeps,
            Action::Audit => AppStatus::Auditing,
            Action::RunScript(name) => AppStatus::RunningScriptStarting(name.clone()),
        }
    }

    pub fn failure_status(&self) -> AppStatus {
        AppStatus::Error(match self {
            Action::Start => ErrorKind::Start,
            Action::Install => ErrorKind::Install,
            Action::Update => ErrorKind::Update,
            Action::Audit => ErrorKind::Audit,
            Action::RunScript(_) => ErrorKind::Script,
        })
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Action::Start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(AppStatus::Starting, true)]
    #[case(AppStatus::RunningScriptStarting("dev".into()), true)]
    #[case(AppStatus::Stopping, true)]
    #[case(AppStatus::Installing, true)]
    #[case(AppStatus::Cleaning, true)]
    #[case(AppStatus::Deleting, true)]
    #[case(AppStatus::Auditing, true)]
    #[case(AppStatus::UpdatingDeps, true)]
    #[case(AppStatus::Running, false)]
    #[case(AppStatus::RunningScript("dev".into()), false)]
    #[case(AppStatus::Stopped, false)]
    #[case(AppStatus::Installed, false)]
    #[case(AppStatus::Error(ErrorKind::Stop), false)]
    #[case(AppStatus::Unknown, false)]
    fn test_is_busy(#[case] status: AppStatus, #[case] busy: bool) {
        assert_eq!(status.is_busy(), busy);
    }

    #[test]
    fn test_live_and_stoppable() {
        assert!(AppStatus::Running.is_live());
        assert!(AppStatus::RunningScript("watch".into()).is_live());
        assert!(!AppStatus::Starting.is_live());

        assert!(AppStatus::Starting.is_stoppable());
        assert!(AppStatus::RunningScriptStarting("dev".into()).is_stoppable());
        assert!(!AppStatus::Stopping.is_stoppable());
        assert!(!AppStatus::Installed.is_stoppable());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(AppStatus::Starting.to_string(), "Starting...");
        assert_eq!(
            AppStatus::RunningScript("dev".into()).to_string(),
            "Running Script: dev"
        );
        assert_eq!(
            AppStatus::RunningScriptStarting("dev".into()).to_string(),
            "Running Script: dev..."
        );
        assert_eq!(
            AppStatus::Error(ErrorKind::NoStartTarget).to_string(),
            "Error (No Start Target)"
        );
    }

    #[test]
    fn test_busy_statuses_display_with_ellipsis() {
        let busy = [
            AppStatus::Starting,
            AppStatus::Stopping,
            AppStatus::Installing,
            AppStatus::Cleaning,
            AppStatus::Deleting,
            AppStatus::Auditing,
            AppStatus::UpdatingDeps,
            AppStatus::RunningScriptStarting("x".into()),
        ];
        for status in busy {
            assert!(status.to_string().ends_with("..."), "{}", status);
        }
    }

    #[test]
    fn test_action_statuses() {
        assert_eq!(Action::Start.interim_status(), AppStatus::Starting);
        assert_eq!(
            Action::RunScript("build".into()).interim_status(),
            AppStatus::RunningScriptStarting("build".into())
        );
        assert_eq!(
            Action::Install.failure_status(),
            AppStatus::Error(ErrorKind::Install)
        );
        assert_eq!(
            Action::RunScript("build".into()).failure_status(),
            AppStatus::Error(ErrorKind::Script)
        );
        assert!(Action::Start.interim_status().is_busy());
        assert!(Action::Update.interim_status().is_busy());
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(AppStatus::RunningScript("dev".into())).unwrap();
        assert_eq!(json["state"], "running_script");
        assert_eq!(json["detail"], "dev");

        let json = serde_json::to_value(AppStatus::Error(ErrorKind::NoStartTarget)).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["detail"], "no_start_target");

        let back: AppStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, AppStatus::Error(ErrorKind::NoStartTarget));
    }
}
