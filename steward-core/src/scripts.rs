use std::io::Write;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Could not write script to temporary file")]
    Write(#[source] std::io::Error),

    #[error("Could not execute script")]
    Exec(#[source] std::io::Error),
}

/// Runs an embedded pkginfo script (installcheck, preinstall, ...) and
/// returns its exit status. The script text is written to a temporary file,
/// made executable and run with no arguments; stdout/stderr are logged.
pub fn run_embedded_script(label: &str, script: &str) -> Result<i32, ScriptError> {
    let mut file = tempfile::Builder::new()
        .prefix(label)
        .tempfile()
        .map_err(ScriptError::Write)?;
    file.write_all(script.as_bytes()).map_err(ScriptError::Write)?;
    file.flush().map_err(ScriptError::Write)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(file.path(), perms).map_err(ScriptError::Write)?;
    }

    log::debug!("Running {} script", label);
    let output = Command::new(file.path())
        .output()
        .map_err(ScriptError::Exec)?;

    if !output.stdout.is_empty() {
        log::info!(
            "{} output: {}",
            label,
            String::from_utf8_lossy(&output.stdout).trim_end()
        );
    }
    if !output.stderr.is_empty() {
        log::warn!(
            "{} stderr: {}",
            label,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }

    let code = output.status.code().unwrap_or(-1);
    if code != 0 {
        log::warn!("{} script returned {}", label, code);
    }
    Ok(code)
}
