use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one home directory per account
    pub mail_root: String,
    /// Maildir directory name inside each home directory
    pub maildir_name: String,
    pub rspamd_url: String,
    pub checkv2_path: String,
    /// Base URL of the address book / spam class service
    pub filterctl_url: String,
    /// Local hostname reported to rspamd; read from the kernel when unset
    pub hostname: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub ca_cert: Option<String>,
    pub reputation_domain: String,
    pub disabled_symbols: Vec<String>,
    // RFC says 76; but we append a ] after breaking X-Spam-Status
    pub max_header_length: usize,
    pub timeout_seconds: u64,
    pub continue_on_error: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mail_root: "/home".to_string(),
            maildir_name: "Maildir".to_string(),
            rspamd_url: "http://127.0.0.1:11333".to_string(),
            checkv2_path: "/checkv2".to_string(),
            filterctl_url: "https://127.0.0.1:2016".to_string(),
            hostname: None,
            client_cert: None,
            client_key: None,
            ca_cert: None,
            reputation_domain: "score.senderscore.com".to_string(),
            disabled_symbols: vec!["DATE_IN_PAST".to_string()],
            max_header_length: 75,
            timeout_seconds: 30,
            continue_on_error: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {path}"))?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the values that would otherwise only fail mid-rescan.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.rspamd_url)
            .with_context(|| format!("invalid rspamd_url: {}", self.rspamd_url))?;
        url::Url::parse(&self.filterctl_url)
            .with_context(|| format!("invalid filterctl_url: {}", self.filterctl_url))?;
        if self.reputation_domain.trim_matches('.').is_empty() {
            return Err(anyhow!("reputation_domain is empty"));
        }
        // room for "X-Spam-Status: " plus one token
        if self.max_header_length < 32 {
            return Err(anyhow!(
                "max_header_length {} is too small",
                self.max_header_length
            ));
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(anyhow!("client_cert and client_key must be set together"));
        }
        for path in [&self.client_cert, &self.client_key, &self.ca_cert]
            .into_iter()
            .flatten()
        {
            expand_path(path)?;
        }
        Ok(())
    }

    pub fn local_hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Expand a leading `~` to the home directory of the invoking user.
pub fn expand_path(path: &str) -> anyhow::Result<PathBuf> {
    if path.len() < 2 {
        return Err(anyhow!("path too short: {path}"));
    }
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").context("HOME is not set")?;
        return Ok(PathBuf::from(home).join(rest.trim_start_matches('/')));
    }
    Ok(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "rspamd_url: http://rspamd.local:11333\ncontinue_on_error: true\n",
        )
        .unwrap();
        assert_eq!(config.rspamd_url, "http://rspamd.local:11333");
        assert!(config.continue_on_error);
        assert_eq!(config.max_header_length, 75);
        assert_eq!(config.disabled_symbols, vec!["DATE_IN_PAST".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescan.yaml");
        let path = path.to_str().unwrap();

        let config = Config {
            hostname: Some("mx1.example.org".to_string()),
            ..Default::default()
        };
        config.to_file(path).unwrap();
        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.hostname.as_deref(), Some("mx1.example.org"));
        assert_eq!(loaded.local_hostname(), "mx1.example.org");
    }

    #[test]
    fn test_validate_rejects_half_configured_identity() {
        let config = Config {
            client_cert: Some("/etc/ssl/rescan.pem".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_path() {
        assert!(expand_path("~").is_err());
        assert_eq!(
            expand_path("/etc/ssl/ca.pem").unwrap(),
            PathBuf::from("/etc/ssl/ca.pem")
        );
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_path("~/certs/client.pem").unwrap(),
                PathBuf::from(home).join("certs/client.pem")
            );
        }
    }
}
