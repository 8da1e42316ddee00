use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

/// Typed process configuration, read once at start.
#[derive(Clone, Debug)]
pub struct Config {
    // signal-cli
    pub signal_cli_path: PathBuf,
    pub signal_account: String,

    // Admin gate
    pub admins: Vec<UserId>,

    // Storage
    pub data_dir: PathBuf,

    // Delivery
    pub send_timeout: Duration,
    pub delivery_retries: u32,
    pub retry_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let signal_account = env_str("SIGNAL_ACCOUNT").and_then(non_empty).ok_or_else(|| {
            Error::Config("SIGNAL_ACCOUNT environment variable is required".to_string())
        })?;

        let signal_cli_path = env_path("SIGNAL_CLI_PATH")
            .or_else(|| which_in_path("signal-cli"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/signal-cli"));

        let admins_file = match env_path("WHISPR_ADMINS_FILE") {
            Some(p) => Some(fs::read_to_string(&p).map_err(|e| {
                Error::Config(format!("cannot read WHISPR_ADMINS_FILE {}: {e}", p.display()))
            })?),
            None => None,
        };
        let admins = parse_admins(env_str("WHISPR_ADMINS"), admins_file)?;

        let data_dir = env_path("WHISPR_DATA_DIR").unwrap_or_else(|| PathBuf::from("whispr-data"));

        let send_timeout = Duration::from_millis(env_u64("SEND_TIMEOUT_MS").unwrap_or(10_000));
        let delivery_retries = env_u32("DELIVERY_RETRIES").unwrap_or(2);
        let retry_delay = Duration::from_millis(env_u64("RETRY_DELAY_MS").unwrap_or(0));

        Ok(Self {
            signal_cli_path,
            signal_account,
            admins,
            data_dir,
            send_timeout,
            delivery_retries,
            retry_delay,
        })
    }
}

/// Admin ids from a CSV env value and/or a file with one id per line
/// (`#` starts a comment).
pub fn parse_admins(csv: Option<String>, file: Option<String>) -> Result<Vec<UserId>> {
    let from_csv = csv.unwrap_or_default();
    let from_file = file.unwrap_or_default();

    let entries = from_csv.split(',').chain(
        from_file
            .lines()
            .map(|l| l.split('#').next().unwrap_or("")),
    );

    let mut out: Vec<UserId> = Vec::new();
    for raw in entries.map(str::trim).filter(|s| !s.is_empty()) {
        let id = UserId::parse_target(raw)
            .ok_or_else(|| Error::Config(format!("invalid admin id: {raw}")))?;
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
