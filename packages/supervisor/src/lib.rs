// ABOUTME: Process lifecycle and reconciliation engine for a folder of Node projects
// ABOUTME: Registry, command executor, termination protocol, reconciliation scanner and the Supervisor facade

pub mod activity;
pub mod config;
pub mod detector;
pub mod executor;
pub mod inspect;
pub mod manager;
pub mod process;
pub mod registry;
mod scaffold;
pub mod scanner;
pub mod termination;
pub mod types;

pub use activity::{ActivityLog, LogEntry, LogLevel, LogSink, DEFAULT_LOG_CAPACITY};
pub use config::{StopTimeouts, SupervisorConfig};
pub use detector::{OutputPortHeuristic, PortDetector};
pub use executor::{CommandExecutor, CommandSpec};
pub use inspect::{ProcessInfo, ProcessInspector, SystemProcesses};
pub use manager::{DrainReport, RestartOutcome, Supervisor};
pub use process::OwnedProcess;
pub use registry::Registry;
pub use scanner::Scanner;
pub use termination::{StopSignal, Terminator};
pub use types::{ActionRejected, AppRecord, RecordUpdate, RegistryEvent};

// Re-export the vocabulary callers need alongside the engine
pub use nodefleet_core::{Action, AppStatus, ErrorKind, VcsBranch, VcsDirty, VcsInfo};
