use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, populated from CLI flags with environment-variable
/// fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "gitmirrord",
    about = "Read-only Git Smart-HTTP reverse proxy backed by bare mirrors"
)]
pub struct Config {
    /// Socket address for the HTTP listener.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Root directory for bare git mirrors.
    #[arg(long, env = "MIRROR_DIR", default_value = "/mnt/git-mirrors")]
    pub mirror_dir: String,

    /// Re-fetch a mirror when its last successful sync is older than this.
    #[arg(long, env = "SYNC_STALE_AFTER", default_value = "2s", value_parser = humantime::parse_duration)]
    pub sync_stale_after: Duration,

    /// Size budget for the mirror root: absolute (`200GiB`, `50GB`) or a
    /// percentage of the hosting filesystem (`80%`).
    #[arg(long, env = "MIRROR_MAX_SIZE", default_value = "80%")]
    pub mirror_max_size: SizeSpec,

    /// Comma-separated list of upstream hosts the proxy will mirror.
    #[arg(long, env = "ALLOWED_UPSTREAMS", default_value = "github.com", value_delimiter = ',')]
    pub allowed_upstreams: Vec<String>,

    /// Log level used when RUST_LOG is not set: debug, info, warn, error.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// How the upstream is authenticated when cloning and syncing.
    #[arg(long, env = "AUTH_MODE", value_enum, default_value_t = AuthMode::PassThrough)]
    pub auth_mode: AuthMode,

    /// Static bearer token, required when --auth-mode=static.
    #[arg(long, env = "STATIC_TOKEN", default_value = "")]
    pub static_token: String,

    /// pack.threads for upload-pack invocations (0 means git's default).
    #[arg(long, env = "UPLOAD_PACK_THREADS", default_value_t = 0)]
    pub upload_pack_threads: usize,

    /// Serialize upload-pack per repo to reduce concurrent packing CPU.
    #[arg(long, env = "SERIALIZE_UPLOAD_PACK", default_value_t = false)]
    pub serialize_upload_pack: bool,

    /// Run lightweight maintenance (commit-graph + midx bitmap) after each sync.
    #[arg(long, env = "MAINTAIN_AFTER_SYNC", default_value_t = false)]
    pub maintain_after_sync: bool,

    /// Cache upload-pack responses for single-want depth-1 requests.
    #[arg(long, env = "ENABLE_PACK_CACHE", default_value_t = false)]
    pub enable_pack_cache: bool,

    /// One-shot mode: run maintenance on the given repo key
    /// (host/owner/repo) or "all", then exit.
    #[arg(long, env = "MAINTENANCE_REPO", default_value = "")]
    pub maintenance_repo: String,

    /// Maintenance depth used by the one-shot mode.
    #[arg(long, env = "MAINTENANCE_MODE", value_enum, default_value_t = MaintenanceMode::Full)]
    pub maintenance_mode: MaintenanceMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Never send credentials upstream.
    None,
    /// Forward the client's Authorization header.
    PassThrough,
    /// Use the configured static token for every upstream operation.
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MaintenanceMode {
    /// Repack with bitmap index, then commit-graph and multi-pack-index.
    Full,
    /// Commit-graph and multi-pack-index only.
    Light,
}

impl Config {
    pub fn load() -> Result<Self> {
        let cfg = Self::parse();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse from an explicit argument list (test and embedding seam).
    pub fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cfg = Self::try_parse_from(args).context("parse arguments")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sanity checks that cannot be expressed purely with clap.
    fn validate(&self) -> Result<()> {
        ensure!(
            self.allowed_upstreams.iter().any(|h| !h.trim().is_empty()),
            "at least one allowed upstream is required"
        );
        if self.auth_mode == AuthMode::Static {
            ensure!(
                !self.static_token.is_empty(),
                "--auth-mode=static requires STATIC_TOKEN"
            );
        }
        Ok(())
    }

    /// Whether this invocation is the one-shot maintenance mode.
    pub fn is_maintenance_run(&self) -> bool {
        !self.maintenance_repo.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SizeSpec
// ---------------------------------------------------------------------------

/// A size budget, either absolute bytes or a percentage of the hosting
/// filesystem's capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    Bytes(u64),
    Percent(f64),
}

impl Default for SizeSpec {
    fn default() -> Self {
        SizeSpec::Percent(80.0)
    }
}

impl FromStr for SizeSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(SizeSpec::default());
        }
        if let Some(pct) = s.strip_suffix('%') {
            let pct: f64 = pct.trim().parse().context("invalid percentage")?;
            ensure!(
                pct > 0.0 && pct <= 100.0,
                "percentage must be in (0, 100], got {pct}"
            );
            return Ok(SizeSpec::Percent(pct));
        }
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let num: f64 = num.trim().parse().context("invalid size")?;
        let multiplier: u64 = match unit.trim() {
            "" | "B" => 1,
            "KB" => 1000,
            "MB" => 1000_u64.pow(2),
            "GB" => 1000_u64.pow(3),
            "TB" => 1000_u64.pow(4),
            "KiB" => 1 << 10,
            "MiB" => 1 << 20,
            "GiB" => 1 << 30,
            "TiB" => 1 << 40,
            other => bail!("unknown size unit: {other:?}"),
        };
        Ok(SizeSpec::Bytes((num * multiplier as f64) as u64))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::load_from(["gitmirrord"]).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.sync_stale_after, Duration::from_secs(2));
        assert_eq!(cfg.mirror_max_size, SizeSpec::Percent(80.0));
        assert_eq!(cfg.allowed_upstreams, vec!["github.com".to_string()]);
        assert_eq!(cfg.auth_mode, AuthMode::PassThrough);
        assert!(!cfg.is_maintenance_run());
    }

    #[test]
    fn static_auth_requires_token() {
        assert!(Config::load_from(["gitmirrord", "--auth-mode=static"]).is_err());
        let cfg =
            Config::load_from(["gitmirrord", "--auth-mode=static", "--static-token=tok"]).unwrap();
        assert_eq!(cfg.static_token, "tok");
    }

    #[test]
    fn allowed_upstreams_are_split() {
        let cfg = Config::load_from([
            "gitmirrord",
            "--allowed-upstreams=github.com,gitlab.example.com",
        ])
        .unwrap();
        assert_eq!(cfg.allowed_upstreams.len(), 2);
        assert_eq!(cfg.allowed_upstreams[1], "gitlab.example.com");
    }

    #[test]
    fn size_spec_absolute() {
        assert_eq!(
            "1GB".parse::<SizeSpec>().unwrap(),
            SizeSpec::Bytes(1_000_000_000)
        );
        assert_eq!(
            "200GiB".parse::<SizeSpec>().unwrap(),
            SizeSpec::Bytes(200 << 30)
        );
        assert_eq!("512".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(512));
        assert_eq!("1.5KiB".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(1536));
    }

    #[test]
    fn size_spec_percent() {
        assert_eq!("80%".parse::<SizeSpec>().unwrap(), SizeSpec::Percent(80.0));
        assert!("0%".parse::<SizeSpec>().is_err());
        assert!("150%".parse::<SizeSpec>().is_err());
    }

    #[test]
    fn size_spec_empty_is_default() {
        assert_eq!("".parse::<SizeSpec>().unwrap(), SizeSpec::Percent(80.0));
        assert!("12XB".parse::<SizeSpec>().is_err());
    }

    #[test]
    fn maintenance_run_detection() {
        let cfg = Config::load_from([
            "gitmirrord",
            "--maintenance-repo=github.com/octocat/hello",
            "--maintenance-mode=light",
        ])
        .unwrap();
        assert!(cfg.is_maintenance_run());
        assert_eq!(cfg.maintenance_mode, MaintenanceMode::Light);
    }
}
