use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: crate::llm::Provider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: crate::llm::Provider::default(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            api_key_env: None,
            base_url: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Wire framing the order backend speaks.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    /// MCP over streamable HTTP: `tools/call {name, arguments}`.
    #[default]
    Mcp,
    /// Plain JSON-RPC: method = operation name, params = arguments.
    JsonRpc,
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default)]
    pub protocol: BackendProtocol,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub check_on_startup: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            protocol: BackendProtocol::default(),
            timeout_secs: default_backend_timeout(),
            check_on_startup: true,
        }
    }
}

/// Bounds applied to every user turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Most recent history entries sent to the model.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Run the calls of one tool round concurrently instead of in order.
    #[serde(default)]
    pub concurrent_tools: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            max_tool_rounds: default_max_tool_rounds(),
            concurrent_tools: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_retries: default_rate_limit_retries(),
            transient_retries: default_transient_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Branding and catalog hints woven into the system instructions.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_company_name")]
    pub company_name: String,
    #[serde(default = "default_categories")]
    pub product_categories: Vec<ProductCategory>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            company_name: default_company_name(),
            product_categories: default_categories(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductCategory {
    pub name: String,
    #[serde(default)]
    pub examples: String,
}

// Defaults
fn default_model() -> String {
    "gemini-1.5-flash".into()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_backend_url() -> String {
    std::env::var("ORDERDESK_BACKEND_URL").unwrap_or_else(|_| "http://localhost:8000/mcp".into())
}
fn default_backend_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_history_window() -> usize {
    6
}
fn default_max_tool_rounds() -> u32 {
    5
}
fn default_rate_limit_retries() -> u32 {
    3
}
fn default_transient_retries() -> u32 {
    1
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_company_name() -> String {
    "TechSupport Pro".into()
}
fn default_categories() -> Vec<ProductCategory> {
    [
        ("Computers", "desktops, laptops, workstations, gaming PCs"),
        ("Monitors", "24\", 27\", 32\", ultrawide, 4K, curved, portable"),
        ("Printers", "laser, inkjet, all-in-one, photo, 3D, label"),
        ("Accessories", "keyboards, mice, webcams, headsets, docking stations"),
        ("Networking", "routers, switches, access points, modems"),
    ]
    .into_iter()
    .map(|(name, examples)| ProductCategory {
        name: name.into(),
        examples: examples.into(),
    })
    .collect()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(Error::config("backend.url must not be empty"));
        }
        if self.conversation.history_window == 0 {
            return Err(Error::config("conversation.history_window must be at least 1"));
        }
        if self.conversation.max_tool_rounds == 0 {
            return Err(Error::config("conversation.max_tool_rounds must be at least 1"));
        }
        if self.backend.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(Error::config("timeouts must be at least one second"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;

    #[test]
    fn full_config_parses() {
        let toml = r#"
[llm]
provider = "anthropic"
model = "claude-sonnet-4-5"
max_tokens = 1024
timeout_secs = 20

[backend]
url = "https://orders.example.com/mcp"
protocol = "jsonrpc"
timeout_secs = 10
check_on_startup = false

[conversation]
history_window = 10
max_tool_rounds = 3
concurrent_tools = true

[retry]
rate_limit_retries = 2
base_delay_ms = 250

[assistant]
company_name = "Acme"
[[assistant.product_categories]]
name = "Widgets"
examples = "small, large"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.llm.provider, Provider::Anthropic));
        assert_eq!(config.llm.timeout_secs, 20);
        assert_eq!(config.backend.protocol, BackendProtocol::JsonRpc);
        assert!(!config.backend.check_on_startup);
        assert_eq!(config.conversation.history_window, 10);
        assert!(config.conversation.concurrent_tools);
        assert_eq!(config.retry.rate_limit_retries, 2);
        assert_eq!(config.retry.transient_retries, 1);
        assert_eq!(config.assistant.product_categories.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(matches!(config.llm.provider, Provider::Gemini));
        assert_eq!(config.llm.model, "gemini-1.5-flash");
        assert_eq!(config.backend.protocol, BackendProtocol::Mcp);
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.conversation.history_window, 6);
        assert_eq!(config.conversation.max_tool_rounds, 5);
        assert_eq!(config.retry.rate_limit_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.assistant.product_categories.len(), 5);
    }

    #[test]
    fn validate_rejects_zero_bounds() {
        let mut config = Config::default();
        config.conversation.max_tool_rounds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.conversation.history_window = 0;
        assert!(config.validate().is_err());
    }
}
