/// Manifest file that marks a directory as a project
pub const MANIFEST_FILE: &str = "package.json";

/// Directory whose presence means dependencies are installed
pub const INSTALLED_MARKER_DIR: &str = "node_modules";

/// Entry files tried in order when the manifest declares neither a start script nor `main`
pub const COMMON_ENTRY_FILES: &[&str] = &["index.js", "app.js", "server.js", "main.js"];

/// Script names that keep running until stopped
pub const LONG_RUNNING_SCRIPTS: &[&str] = &["start", "dev", "serve", "watch"];

/// Whether a script is expected to keep running (dev servers, watchers).
///
/// Name heuristic only: `start`, `dev`, `serve`, `watch`, or any name
/// containing "watch" or "dev".
pub fn is_long_running_script(name: &str) -> bool {
    let lower = name.to_lowercase();
    LONG_RUNNING_SCRIPTS.contains(&lower.as_str()) || lower.contains("watch") || lower.contains("dev")
}
