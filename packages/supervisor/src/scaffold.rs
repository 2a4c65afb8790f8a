// ABOUTME: Creates a minimal runnable project: a package.json and an index.js HTTP server
// ABOUTME: A partially written folder is removed again if any step fails

use nodefleet_core::{sanitize_project_name, MANIFEST_FILE};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

use crate::types::ActionRejected;

const ENTRY_FILE: &str = "index.js";
const DEFAULT_SERVER_PORT: u16 = 3000;

fn manifest_for(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "version": "0.1.0",
        "description": format!("Basic Node.js project: {}", name),
        "main": ENTRY_FILE,
        "scripts": {
            "start": format!("node {}", ENTRY_FILE),
            "test": "echo \"Error: no test specified\" && exit 1"
        },
        "keywords": [],
        "author": "",
        "license": "ISC"
    })
}

fn entry_source(name: &str) -> String {
    format!(
        r#"// Basic Node.js server
const http = require('http');

const hostname = '127.0.0.1';
const port = {port};

const server = http.createServer((req, res) => {{
  res.statusCode = 200;
  res.setHeader('Content-Type', 'text/plain');
  res.end('Hello from {name}!\n');
}});

server.listen(port, hostname, () => {{
  console.log(`Server running at http://${{hostname}}:${{port}}/ for project {name}`);
}});
"#,
        port = DEFAULT_SERVER_PORT,
        name = name,
    )
}

/// Create `<root>/<sanitized name>` with a manifest and entry file.
///
/// # Errors
///
/// * `ActionRejected::InvalidName` - Nothing is left after sanitizing
/// * `ActionRejected::AlreadyExists` - The folder is already there
/// * `ActionRejected::Io` - Writing failed (the folder is cleaned up)
pub(crate) async fn create_basic_project(
    root: &Path,
    raw_name: &str,
) -> Result<PathBuf, ActionRejected> {
    let name = sanitize_project_name(raw_name);
    if name.is_empty() {
        return Err(ActionRejected::InvalidName {
            name: raw_name.to_string(),
        });
    }

    let project_dir = root.join(&name);
    if fs::try_exists(&project_dir).await.unwrap_or(false) {
        return Err(ActionRejected::AlreadyExists { path: project_dir });
    }

    if let Err(e) = write_files(&project_dir, &name).await {
        if let Err(cleanup) = fs::remove_dir_all(&project_dir).await {
            warn!(
                "Failed to clean up partial project {}: {}",
                project_dir.display(),
                cleanup
            );
        }
        return Err(e.into());
    }

    Ok(project_dir)
}

async fn write_files(project_dir: &Path, name: &str) -> std::io::Result<()> {
    fs::create_dir_all(project_dir).await?;

    let manifest = serde_json::to_string_pretty(&manifest_for(name))?;
    fs::write(project_dir.join(MANIFEST_FILE), manifest).await?;
    fs::write(project_dir.join(ENTRY_FILE), entry_source(name)).await?;
    Ok(())
}
