//! Where strata keeps its state
//!
//! The state directory is the first of:
//! 1. `--state-dir`
//! 2. `STRATA_STATE_DIR`
//! 3. `$XDG_STATE_HOME/strata`
//! 4. `%LOCALAPPDATA%\strata` on Windows, `~/.local/state/strata` elsewhere
//!
//! Each stack gets its own `<stack>.json` inside it.

use anyhow::{Context, Result};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;

pub const ENV_STATE_DIR: &str = "STRATA_STATE_DIR";

const APP_DIR: &str = "strata";

/// Resolve the state directory, `flag` being the `--state-dir` value
pub fn state_dir(flag: Option<&str>) -> Result<PathBuf> {
    let (source, path) = if let Some(dir) = flag {
        ("--state-dir", expand(dir))
    } else if let Ok(dir) = env::var(ENV_STATE_DIR) {
        (ENV_STATE_DIR, expand(&dir))
    } else if let Ok(xdg) = env::var("XDG_STATE_HOME") {
        ("XDG_STATE_HOME", PathBuf::from(xdg).join(APP_DIR))
    } else {
        ("platform default", platform_state_dir()?)
    };
    log::debug!("State dir from {source}: {}", path.display());
    Ok(path)
}

#[cfg(windows)]
fn platform_state_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .context("Could not determine local app data directory")
}

#[cfg(not(windows))]
fn platform_state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join(APP_DIR))
}

/// Expand `~` and `$VARS`; unknown variables leave the input as is
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sets or clears a variable until dropped
    struct EnvGuard {
        key: &'static str,
        saved: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let saved = env::var(key).ok();
            // SAFETY: only the single env test below mutates the environment
            unsafe {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
            Self { key, saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            // SAFETY: see EnvGuard::set
            unsafe {
                match &self.saved {
                    Some(v) => env::set_var(self.key, v),
                    None => env::remove_var(self.key),
                }
            }
        }
    }

    #[test]
    fn test_flag_wins() {
        assert_eq!(
            state_dir(Some("/srv/strata")).unwrap(),
            PathBuf::from("/srv/strata")
        );
    }

    // One test so the env mutations never interleave
    #[test]
    fn test_state_dir_resolution_order() {
        {
            let _dir = EnvGuard::set(ENV_STATE_DIR, Some("/var/lib/strata"));
            let _xdg = EnvGuard::set("XDG_STATE_HOME", Some("/tmp/xdg"));
            assert_eq!(state_dir(None).unwrap(), PathBuf::from("/var/lib/strata"));
        }
        {
            let _dir = EnvGuard::set(ENV_STATE_DIR, None);
            let _xdg = EnvGuard::set("XDG_STATE_HOME", Some("/tmp/xdg"));
            assert_eq!(state_dir(None).unwrap(), PathBuf::from("/tmp/xdg/strata"));
        }
        #[cfg(not(windows))]
        {
            let _dir = EnvGuard::set(ENV_STATE_DIR, None);
            let _xdg = EnvGuard::set("XDG_STATE_HOME", None);
            let home = dirs::home_dir().unwrap();
            assert_eq!(
                state_dir(None).unwrap(),
                home.join(".local/state/strata")
            );
        }
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand("~/stacks/dev.toml"), home.join("stacks/dev.toml"));
    }

    #[test]
    fn test_expand_keeps_unknown_variable() {
        let raw = "/stacks/$STRATA_UNSET_VARIABLE_4821/stack.toml";
        assert_eq!(expand(raw), PathBuf::from(raw));
    }
}
