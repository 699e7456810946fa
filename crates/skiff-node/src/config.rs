//! Runner configuration from the command line and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use skiff_client::SecurityMode;
use skiff_shared::RoomId;

/// Settings for one loopback run.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// File to seed and download. First positional argument.
    pub file: PathBuf,

    /// Room both peers join.
    /// Env: `SKIFF_NODE_ROOM`
    /// Default: `loopback`
    pub room: RoomId,

    /// Env: `SKIFF_NODE_MODE` (`open`, `password`, `forward-secure`)
    /// and `SKIFF_NODE_PASSWORD` for password rooms.
    /// Default: `open`
    pub mode: SecurityMode,

    /// Probability that the bus drops any single delivery.
    /// Env: `SKIFF_NODE_LOSS`
    /// Default: `0.0`
    pub loss_rate: f64,

    /// Give up if the download has not finished by then.
    /// Env: `SKIFF_NODE_TIMEOUT_SECS`
    /// Default: `120`
    pub timeout: Duration,

    /// Assemble through the on-disk SQLite piece store instead of memory.
    /// Env: `SKIFF_NODE_SQLITE` (true/false)
    /// Default: `true`
    pub sqlite: bool,
}

impl NodeConfig {
    pub fn from_args_and_env(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let Some(file) = args.next() else {
            bail!("usage: skiff-node <file>");
        };
        if let Some(extra) = args.next() {
            bail!("unexpected argument: {extra}");
        }

        let mode = parse_mode(
            &env_or("SKIFF_NODE_MODE", "open"),
            std::env::var("SKIFF_NODE_PASSWORD").ok(),
        )?;

        let loss_rate: f64 = env_or("SKIFF_NODE_LOSS", "0")
            .parse()
            .context("SKIFF_NODE_LOSS must be a number")?;
        if !(0.0..1.0).contains(&loss_rate) {
            bail!("SKIFF_NODE_LOSS must be in [0, 1)");
        }

        let timeout_secs: u64 = env_or("SKIFF_NODE_TIMEOUT_SECS", "120")
            .parse()
            .context("SKIFF_NODE_TIMEOUT_SECS must be an integer")?;

        let sqlite = env_or("SKIFF_NODE_SQLITE", "true")
            .parse()
            .context("SKIFF_NODE_SQLITE must be true or false")?;

        Ok(Self {
            file: PathBuf::from(file),
            room: RoomId::new(env_or("SKIFF_NODE_ROOM", "loopback")),
            mode,
            loss_rate,
            timeout: Duration::from_secs(timeout_secs),
            sqlite,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn parse_mode(raw: &str, password: Option<String>) -> anyhow::Result<SecurityMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "open" => Ok(SecurityMode::Open),
        "password" => match password {
            Some(p) if !p.is_empty() => Ok(SecurityMode::Password(p)),
            _ => bail!("password mode needs SKIFF_NODE_PASSWORD"),
        },
        "forward-secure" | "fs" => Ok(SecurityMode::ForwardSecure),
        other => bail!("unknown security mode {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("open", None).unwrap(), SecurityMode::Open);
        assert_eq!(parse_mode("FS", None).unwrap(), SecurityMode::ForwardSecure);
        assert_eq!(
            parse_mode("password", Some("pw".into())).unwrap(),
            SecurityMode::Password("pw".into())
        );
        assert!(parse_mode("password", None).is_err());
        assert!(parse_mode("rot13", None).is_err());
    }

    #[test]
    fn test_file_argument_required() {
        assert!(NodeConfig::from_args_and_env(std::iter::empty()).is_err());

        let args = ["a.bin", "b.bin"].into_iter().map(String::from);
        assert!(NodeConfig::from_args_and_env(args).is_err());
    }
}
