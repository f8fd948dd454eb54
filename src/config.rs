use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway names that the standard route table shadows at top level
pub const RESERVED_GATEWAY_NAMES: [&str; 4] = ["meta", "request", "response", "test"];

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Gateway configurations, in file order
    #[serde(default)]
    pub gateways: Gateways,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Base URL for internal targets such as `/cids` (default: http://127.0.0.1:<port>)
    pub internal_base_url: Option<String>,

    /// Directory for filesystem CID lookups (default: current directory)
    #[serde(default = "default_cid_dir")]
    pub cid_dir: PathBuf,

    /// Maximum idle connections per target host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn internal_base_url(&self) -> String {
        self.internal_base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            internal_base_url: None,
            cid_dir: default_cid_dir(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Configuration for a single gateway
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    /// CID of the request transform
    pub request_transform: Option<String>,

    /// CID of the response transform
    pub response_transform: Option<String>,

    /// Template name -> CID
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    /// Target URL for ordinary gateway dispatch (default: internal `/<name>`)
    pub target: Option<String>,

    /// Test paths listed on the meta page
    #[serde(default)]
    pub test_paths: Vec<String>,
}

impl GatewayConfig {
    pub fn with_request_transform(mut self, cid: &str) -> Self {
        self.request_transform = Some(cid.to_string());
        self
    }

    pub fn with_response_transform(mut self, cid: &str) -> Self {
        self.response_transform = Some(cid.to_string());
        self
    }

    pub fn with_template(mut self, name: &str, cid: &str) -> Self {
        self.templates.insert(name.to_string(), cid.to_string());
        self
    }

    pub fn with_target(mut self, url: &str) -> Self {
        self.target = Some(url.to_string());
        self
    }

    /// Validate the gateway configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() || name.contains('/') {
            return Err(format!("Gateway '{}': name must be non-empty and contain no '/'", name));
        }

        for (slot, cid) in [
            ("request_transform", &self.request_transform),
            ("response_transform", &self.response_transform),
        ] {
            if matches!(cid, Some(cid) if cid.trim().is_empty()) {
                return Err(format!("Gateway '{}': '{}' must not be empty", name, slot));
            }
        }

        if let Some((template, _)) = self.templates.iter().find(|(_, cid)| cid.trim().is_empty()) {
            return Err(format!(
                "Gateway '{}': template '{}' has an empty CID",
                name, template
            ));
        }

        Ok(())
    }
}

/// Gateway configurations keyed by name, kept in configuration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gateways {
    entries: Vec<(String, GatewayConfig)>,
}

impl Gateways {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a gateway
    pub fn insert(&mut self, name: &str, config: GatewayConfig) {
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, existing)) => *existing = config,
            None => self.entries.push((name.to_string(), config)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&GatewayConfig> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, config)| config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn sorted_names(&self) -> Vec<String> {
        let mut names = self.names();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GatewayConfig)> {
        self.entries.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, GatewayConfig)> for Gateways {
    fn from_iter<I: IntoIterator<Item = (S, GatewayConfig)>>(iter: I) -> Self {
        let mut gateways = Gateways::new();
        for (name, config) in iter {
            gateways.insert(&name.into(), config);
        }
        gateways
    }
}

impl<'de> Deserialize<'de> for Gateways {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GatewaysVisitor;

        impl<'de> Visitor<'de> for GatewaysVisitor {
            type Value = Gateways;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of gateway configurations")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Gateways, A::Error> {
                let mut gateways = Gateways::new();
                while let Some((name, config)) = map.next_entry::<String, GatewayConfig>()? {
                    gateways.insert(&name, config);
                }
                Ok(gateways)
            }
        }

        deserializer.deserialize_map(GatewaysVisitor)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_cid_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, gateway) in self.gateways.iter() {
            if let Err(e) = gateway.validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Gateways whose names are unreachable at top level and need an alias
    pub fn shadowed_gateways(&self) -> Vec<String> {
        self.gateways
            .names()
            .into_iter()
            .filter(|name| RESERVED_GATEWAY_NAMES.contains(&name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "127.0.0.1"
cid_dir = "/var/lib/cids"

[gateways.demo]
request_transform = "aaa111"
response_transform = "bbb222"
target = "https://api.example.com"
test_paths = ["site/index.html"]

[gateways.demo.templates]
page = "ccc333"

[gateways.cids]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.cid_dir, PathBuf::from("/var/lib/cids"));
        assert_eq!(config.gateways.len(), 2);

        let demo = config.gateways.get("demo").unwrap();
        assert_eq!(demo.request_transform.as_deref(), Some("aaa111"));
        assert_eq!(demo.templates.get("page").unwrap(), "ccc333");
        assert_eq!(demo.test_paths, vec!["site/index.html"]);
        assert_eq!(config.gateways.get("cids").unwrap(), &GatewayConfig::default());
    }

    #[test]
    fn test_gateways_keep_file_order() {
        let toml = r#"
[gateways.zeta]
[gateways.alpha]
[gateways.mid]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.gateways.names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(config.gateways.sorted_names(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.internal_base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.gateways.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_cids() {
        let mut config = Config::default();
        config
            .gateways
            .insert("demo", GatewayConfig::default().with_request_transform(" "));
        config
            .gateways
            .insert("other", GatewayConfig::default().with_template("page", ""));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'request_transform' must not be empty"));
        assert!(err.contains("template 'page' has an empty CID"));
    }

    #[test]
    fn test_validate_rejects_slash_in_name() {
        let gateway = GatewayConfig::default();
        assert!(gateway.validate("a/b").is_err());
        assert!(gateway.validate("ok").is_ok());
    }

    #[test]
    fn test_shadowed_gateways() {
        let gateways: Gateways = [
            ("meta", GatewayConfig::default()),
            ("demo", GatewayConfig::default()),
            ("test", GatewayConfig::default()),
        ]
        .into_iter()
        .collect();
        let config = Config {
            gateways,
            ..Default::default()
        };
        assert_eq!(config.shadowed_gateways(), vec!["meta", "test"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut gateways = Gateways::new();
        gateways.insert("a", GatewayConfig::default());
        gateways.insert("b", GatewayConfig::default());
        gateways.insert("a", GatewayConfig::default().with_target("http://x"));

        assert_eq!(gateways.names(), vec!["a", "b"]);
        assert_eq!(gateways.get("a").unwrap().target.as_deref(), Some("http://x"));
        assert!(!gateways.contains("c"));
    }
}
