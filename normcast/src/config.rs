//! Load config from file and environment.

use std::path::{Path, PathBuf};

use norm_core::config::{ReceiverConfig, SenderConfig, SessionConfig};
use serde::Deserialize;
use tracing::{debug, warn};

/// CLI configuration. File: ~/.config/normcast/config.toml or /etc/normcast/config.toml.
/// Env overrides: NORMCAST_ADDRESS, NORMCAST_PORT, NORMCAST_TX_RATE, NORMCAST_TTL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

/// Load config: defaults, then the first config file found (or `explicit`),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file(&config_paths()).unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/normcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/normcast/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&s)?)
}

/// First existing file wins; a file that fails to parse falls back to defaults.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let p = paths.iter().find(|p| p.exists())?;
    match read_file(p) {
        Ok(c) => {
            debug!(path = %p.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            warn!(path = %p.display(), error = %e, "ignoring unreadable config");
            None
        }
    }
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NORMCAST_ADDRESS") {
        c.session.address = s;
    }
    if let Some(p) = var("NORMCAST_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.session.port = p;
    }
    if let Some(r) = var("NORMCAST_TX_RATE").and_then(|s| s.parse::<f64>().ok()) {
        c.session.tx_rate = Some(r);
    }
    if let Some(t) = var("NORMCAST_TTL").and_then(|s| s.parse::<u8>().ok()) {
        c.session.ttl = Some(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn first_existing_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&present).unwrap();
        writeln!(
            f,
            "[session]\naddress = \"239.9.9.9\"\nport = 7100\n[sender]\nsegment_size = 512"
        )
        .unwrap();

        let c = load_file(&[missing, present]).unwrap();
        assert_eq!(c.session.address, "239.9.9.9");
        assert_eq!(c.session.port, 7100);
        assert_eq!(c.sender.segment_size, 512);
        assert_eq!(c.receiver.buffer_space, ReceiverConfig::default().buffer_space);
    }

    #[test]
    fn bad_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nunknown = 1\n").unwrap();
        assert!(load_file(&[path.clone()]).is_none());
        assert!(load(Some(path.as_path())).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("NORMCAST_PORT", "7200"),
            ("NORMCAST_TX_RATE", "5e6"),
            ("NORMCAST_TTL", "not a number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.session.port, 7200);
        assert_eq!(c.session.tx_rate, Some(5e6));
        assert_eq!(c.session.ttl, None);
        assert_eq!(c.session.address, "224.1.2.3");
    }
}
