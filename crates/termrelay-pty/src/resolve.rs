use std::env;
use std::path::Path;
use std::path::PathBuf;

use crate::error::PtyError;

/// Shell preference list used when the caller has no opinion.
pub fn default_shells() -> Vec<String> {
    let mut shells = Vec::with_capacity(4);
    if let Ok(shell) = env::var("SHELL") {
        if !shell.trim().is_empty() {
            shells.push(shell);
        }
    }
    for fallback in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if !shells.iter().any(|s| s == fallback) {
            shells.push(fallback.to_string());
        }
    }
    shells
}

/// Returns the first candidate that names an executable file.
///
/// Candidates containing a `/` are taken as paths; bare names are looked up
/// on `$PATH`. Blank entries are skipped.
pub fn resolve_program(candidates: &[String]) -> Result<PathBuf, PtyError> {
    let search_path = env::var_os("PATH");

    for candidate in candidates.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        if candidate.contains('/') {
            let path = Path::new(candidate);
            if is_executable(path) {
                return Ok(path.to_path_buf());
            }
            continue;
        }

        if let Some(paths) = search_path.as_ref() {
            if let Some(found) = env::split_paths(paths)
                .map(|dir| dir.join(candidate))
                .find(|path| is_executable(path))
            {
                return Ok(found);
            }
        }
    }

    Err(PtyError::NoShellFound {
        tried: candidates.to_vec(),
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match path.metadata() {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
