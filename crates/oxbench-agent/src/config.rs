use oxbench_collector::policy::EmitterSettings;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Domains job supplied URLs may point at. Empty allows any http(s) host.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Provider name machine counters are published and subscribed under.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    /// Events buffered per stream before a slow reader starts losing them.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_lsass_process")]
    pub lsass_process: String,
}

fn default_agent_name() -> String {
    "oxbench-agent".to_string()
}

fn default_provider() -> String {
    "Oxbench-MachineCounters".to_string()
}

fn default_sampling_interval_ms() -> u64 {
    1000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_lsass_process() -> String {
    "lsass.exe".to_string()
}

const MIN_SAMPLING_INTERVAL_MS: u64 = 100;

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            sampling_interval_ms: default_sampling_interval_ms(),
            event_buffer: default_event_buffer(),
            lsass_process: default_lsass_process(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            allowed_domains: Vec::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{path}': {e}"))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.telemetry.provider.trim().is_empty() {
            anyhow::bail!("telemetry.provider must not be empty");
        }
        Ok(config)
    }
}

impl TelemetryConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms.max(MIN_SAMPLING_INTERVAL_MS))
    }

    pub fn emitter_settings(&self) -> EmitterSettings {
        EmitterSettings {
            sampling_interval: self.sampling_interval(),
            lsass_process: self.lsass_process.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config.agent_name, "oxbench-agent");
        assert!(config.allowed_domains.is_empty());
        assert_eq!(config.telemetry.provider, "Oxbench-MachineCounters");
        assert_eq!(config.telemetry.sampling_interval(), Duration::from_secs(1));
        assert_eq!(config.telemetry.event_buffer, 1024);
    }

    #[test]
    fn parses_full_config() {
        let config = AgentConfig::parse(
            r#"
            agent_name = "perf-lab-01"
            allowed_domains = ["example.com", "assets.internal"]

            [telemetry]
            provider = "Lab-Counters"
            sampling_interval_ms = 20
            event_buffer = 64
            lsass_process = "lsass.exe"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent_name, "perf-lab-01");
        assert_eq!(config.allowed_domains, vec!["example.com", "assets.internal"]);
        assert_eq!(config.telemetry.provider, "Lab-Counters");
        // clamped to the minimum
        assert_eq!(config.telemetry.sampling_interval(), Duration::from_millis(100));
        let settings = config.telemetry.emitter_settings();
        assert_eq!(settings.sampling_interval, Duration::from_millis(100));
        assert_eq!(settings.lsass_process, "lsass.exe");
    }

    #[test]
    fn rejects_blank_provider() {
        let err = AgentConfig::parse("[telemetry]\nprovider = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("provider"));
    }
}
