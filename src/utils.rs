//! Directory helpers following the XDG Base Directory specification
//!
//! # Directory Structure
//!
//! - Config: `~/.config/fwwatch/` - `config.json`
//! - State: `~/.local/state/fwwatch/` - audit log, daemon log
//!
//! When running as root these resolve under `/root`.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwwatch", "fwwatch")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

/// Creates the config and state directories (mode 0o700 on Unix)
pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [get_config_dir(), get_state_dir()].into_iter().flatten() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(&dir)?;
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
