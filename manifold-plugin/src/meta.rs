//! Plugin identity: metadata, version information, and health.

use std::fmt;

/// Descriptive information the plugin author registers once. The
/// metadata tag doubles as the plugin's identity when no explicit id
/// is configured, which makes it part of every device id; changing
/// the name or maintainer of a deployed plugin changes its devices'
/// ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: String,
    pub maintainer: String,
    pub description: String,
    pub vcs: String,
}

impl PluginMetadata {
    pub fn new(
        name: &str,
        maintainer: &str,
        description: &str,
        vcs: &str,
    ) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            maintainer: maintainer.into(),
            description: description.into(),
            vcs: vcs.into(),
        }
    }

    /// The canonical `maintainer/name` tag: lower-cased, spaces and
    /// dashes normalized.
    pub fn tag(&self) -> String {
        format!(
            "{}/{}",
            normalize(&self.maintainer),
            normalize(&self.name)
        )
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join("-")
}

/// Build and version information exposed over the RPC surface and by
/// `--version`. The SDK fields are stamped at compile time; the
/// plugin's own version comes from its author.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub plugin_version: String,
    pub sdk_version: String,
    pub build_date: String,
    pub git_commit: String,
    pub arch: String,
    pub os: String,
}

impl VersionInfo {
    pub fn new(plugin_version: &str) -> VersionInfo {
        VersionInfo {
            plugin_version: plugin_version.into(),
            sdk_version: env!("CARGO_PKG_VERSION").into(),
            build_date: option_env!("BUILD_DATE").unwrap_or("-").into(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("-").into(),
            arch: std::env::consts::ARCH.into(),
            os: std::env::consts::OS.into(),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plugin version: {}", &self.plugin_version)?;
        writeln!(f, "sdk version:    {}", &self.sdk_version)?;
        writeln!(f, "build date:     {}", &self.build_date)?;
        writeln!(f, "git commit:     {}", &self.git_commit)?;
        write!(f, "os/arch:        {}/{}", &self.os, &self.arch)
    }
}

/// The plugin's aggregate health as reported over RPC. There is no
/// deep checking here; the plugin is `Ok` once its scheduler is
/// running and stays that way until shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Ok,
    Failing,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "UNKNOWN"),
            HealthStatus::Ok => write!(f, "OK"),
            HealthStatus::Failing => write!(f, "FAILING"),
        }
    }
}
