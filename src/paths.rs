use std::path::PathBuf;

/// Best-effort home directory resolution.
///
/// We prefer `dirs::home_dir()`, but that can return `None` in some service/test
/// environments. In those cases, fall back to common environment variables.
pub fn user_home_dir() -> Option<PathBuf> {
    dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

/// Return the base `.keygate` directory.
///
/// `KEYGATE_DIR` takes precedence so tests and parallel runs can point the
/// broker at a temp root. If the user's home directory can't be resolved, we
/// fall back to an absolute temp directory to avoid writing into the current
/// working directory.
pub fn keygate_root_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("KEYGATE_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    if let Some(home) = user_home_dir() {
        home.join(".keygate")
    } else {
        std::env::temp_dir().join("keygate-no-home")
    }
}
