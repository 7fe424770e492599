// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for sdrmux-server.
//!
//! Config is loaded from `sdrmux.toml`. Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./sdrmux.toml`
//! 3. `~/.config/sdrmux/sdrmux.toml`
//! 4. `/etc/sdrmux/sdrmux.toml`

use serde::{Deserialize, Serialize};

use sdrmux_app::ConfigFile;

use crate::net::CidrSet;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Multicast groups shared with the radio back end
    pub radio: RadioConfig,
    /// Session caps and lifetimes
    pub sessions: SessionsConfig,
    /// Rate limits
    pub limits: LimitsConfig,
    /// Timeout/cap exemptions
    pub bypass: BypassConfig,
    /// Reverse-proxy trust for client-IP extraction
    pub proxy: ProxyConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

/// Multicast groups and the interface they live on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Control/status group, `<host>:<port>`. Commands go out here and
    /// status for every channel comes back on it.
    pub status_group: String,
    /// RTP data group, `<host>:<port>`.
    pub data_group: String,
    /// Network interface carrying the multicast traffic.
    pub interface: String,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            status_group: "radio-status.local:5006".to_string(),
            data_group: "radio-data.local:5004".to_string(),
            interface: "eth0".to_string(),
        }
    }
}

/// Session admission and lifetime policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Hard cap on concurrent sessions.
    pub max_sessions: usize,
    /// Per-client-IP cap. 0 disables the check.
    pub max_sessions_per_ip: usize,
    /// Per-user-session cap. 0 disables the check.
    pub max_sessions_per_user: usize,
    /// Seconds without keepalive before the janitor evicts. 0 disables.
    pub idle_timeout_secs: u64,
    /// Absolute session lifetime in seconds. 0 disables.
    pub max_lifetime_secs: u64,
    /// Janitor scan cadence.
    pub janitor_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 200,
            max_sessions_per_ip: 8,
            max_sessions_per_user: 0,
            idle_timeout_secs: 300,
            max_lifetime_secs: 12 * 60 * 60,
            janitor_interval_secs: 5,
        }
    }
}

/// Rates for the limiter family. Zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Tuning commands per second, per user, per channel kind.
    pub command_rate_per_sec: f64,
    /// New connections per second, per IP.
    pub connection_rate_per_sec: f64,
    /// Session-open requests per minute, per IP.
    pub session_open_per_min: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            command_rate_per_sec: 10.0,
            connection_rate_per_sec: 5.0,
            session_open_per_min: 30.0,
        }
    }
}

/// Exemptions from per-IP caps and janitor eviction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// CIDRs (or bare addresses) never evicted or capped.
    pub cidrs: Vec<String>,
    /// Password granting the same exemption at session creation.
    pub password: Option<String>,
}

/// Trusted reverse proxies for client-IP extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub trusted_cidrs: Vec<String>,
}

impl ConfigFile for GatewayConfig {
    fn config_filename() -> &'static str {
        "sdrmux.toml"
    }
}

fn validate_group(section: &str, spec: &str) -> Result<(), String> {
    let Some((host, port)) = spec.rsplit_once(':') else {
        return Err(format!("{} must be <host>:<port>, got '{}'", section, spec));
    };
    if host.is_empty() {
        return Err(format!("{} has an empty host", section));
    }
    if port.parse::<u16>().is_err() {
        return Err(format!("{} has an invalid port '{}'", section, port));
    }
    Ok(())
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    match level {
        None => Ok(()),
        Some(l) if l.parse::<tracing::Level>().is_ok() => Ok(()),
        Some(l) => Err(format!("[general].log_level '{}' is not a log level", l)),
    }
}

impl GatewayConfig {
    /// Fatal-at-startup checks. CIDR lists are parsed here once; the
    /// process refuses to start on any invalid entry.
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;

        validate_group("[radio].status_group", &self.radio.status_group)?;
        validate_group("[radio].data_group", &self.radio.data_group)?;
        if self.radio.interface.is_empty() {
            return Err("[radio].interface must be set".to_string());
        }
        if self.radio.status_group == self.radio.data_group {
            return Err("[radio] status_group and data_group must differ".to_string());
        }

        if self.sessions.max_sessions == 0 {
            return Err("[sessions].max_sessions must be > 0".to_string());
        }
        if self.sessions.janitor_interval_secs == 0 {
            return Err("[sessions].janitor_interval_secs must be > 0".to_string());
        }

        CidrSet::parse(&self.bypass.cidrs)
            .map_err(|e| format!("[bypass].cidrs: {}", e))?;
        CidrSet::parse(&self.proxy.trusted_cidrs)
            .map_err(|e| format!("[proxy].trusted_cidrs: {}", e))?;

        Ok(())
    }

    pub fn example_toml() -> String {
        let example = GatewayConfig {
            general: GeneralConfig {
                log_level: Some("info".to_string()),
            },
            radio: RadioConfig::default(),
            sessions: SessionsConfig::default(),
            limits: LimitsConfig::default(),
            bypass: BypassConfig {
                cidrs: vec!["127.0.0.1".to_string(), "10.0.0.0/24".to_string()],
                password: None,
            },
            proxy: ProxyConfig {
                trusted_cidrs: vec!["127.0.0.1".to_string()],
            },
        };

        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(GatewayConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_example_toml_parses() {
        let example = GatewayConfig::example_toml();
        let config: GatewayConfig = toml::from_str(&example).unwrap();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [radio]
            interface = "enp3s0"
            "#,
        )
        .unwrap();
        assert_eq!(config.radio.interface, "enp3s0");
        assert_eq!(config.radio.status_group, "radio-status.local:5006");
        assert_eq!(config.sessions.max_sessions, 200);
    }

    #[test]
    fn test_bad_group_rejected() {
        let mut config = GatewayConfig::default();
        config.radio.status_group = "no-port-here".to_string();
        assert!(config.validate().unwrap_err().contains("status_group"));

        config.radio.status_group = "host:99999".to_string();
        assert!(config.validate().unwrap_err().contains("invalid port"));
    }

    #[test]
    fn test_missing_interface_rejected() {
        let mut config = GatewayConfig::default();
        config.radio.interface = String::new();
        assert!(config.validate().unwrap_err().contains("interface"));
    }

    #[test]
    fn test_bad_bypass_cidr_rejected() {
        let mut config = GatewayConfig::default();
        config.bypass.cidrs = vec!["10.0.0.0/banana".to_string()];
        assert!(config.validate().unwrap_err().contains("[bypass].cidrs"));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = GatewayConfig::default();
        config.general.log_level = Some("shout".to_string());
        assert!(config.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_zero_max_sessions_rejected() {
        let mut config = GatewayConfig::default();
        config.sessions.max_sessions = 0;
        assert!(config.validate().unwrap_err().contains("max_sessions"));
    }
}
