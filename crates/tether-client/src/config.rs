// Subscriber configuration: defaults, env overrides, and validation.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tether_wire::StatusCode;

use crate::flow::FlowControlSettings;

pub const DEFAULT_STREAM_ACK_DEADLINE_SECONDS: u32 = 10;
pub const MIN_STREAM_ACK_DEADLINE_SECONDS: u32 = 10;
pub const MAX_STREAM_ACK_DEADLINE_SECONDS: u32 = 600;
pub(crate) const DEFAULT_CHANNELS_PER_CORE: usize = 4;
pub(crate) const MIN_ACK_EXPIRATION_PADDING: Duration = Duration::from_secs(1);

/// How message intake is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Bidirectional streams, fanned out per core.
    Streaming,
    /// Repeated unary pulls on a single connection.
    Polling,
}

#[derive(Clone)]
pub struct SubscriberConfig {
    /// Fully-qualified subscription identifier. Required.
    pub subscription: String,
    /// Subtracted from deadlines when scheduling extension renewals.
    pub ack_expiration_padding: Duration,
    /// Initial stream ack deadline, within [10, 600].
    pub stream_ack_deadline_seconds: u32,
    /// Streaming fan-out multiplier: streams = cores x channels_per_core.
    pub channels_per_core: usize,
    pub flow_control: FlowControlSettings,
    /// Overrides the default retryable classification when set.
    pub retryable_statuses: Option<HashSet<StatusCode>>,
    pub pull_mode: PullMode,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberConfigOverride {
    ack_expiration_padding_ms: Option<u64>,
    stream_ack_deadline_seconds: Option<u32>,
    channels_per_core: Option<usize>,
    max_outstanding_messages: Option<u64>,
    max_outstanding_bytes: Option<u64>,
}

impl SubscriberConfig {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            ack_expiration_padding: MIN_ACK_EXPIRATION_PADDING,
            stream_ack_deadline_seconds: DEFAULT_STREAM_ACK_DEADLINE_SECONDS,
            channels_per_core: DEFAULT_CHANNELS_PER_CORE,
            flow_control: FlowControlSettings::default(),
            retryable_statuses: None,
            pull_mode: PullMode::Streaming,
        }
    }

    /// Defaults, then `TETHER_*` environment overrides, then the YAML file
    /// named by `config_path` or `TETHER_CLIENT_CONFIG` when present.
    pub fn from_env_or_yaml(
        subscription: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(subscription);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("TETHER_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: SubscriberConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env(subscription: impl Into<String>) -> Self {
        let mut config = Self::new(subscription);
        if let Some(value) = read_u64_env("TETHER_ACK_EXPIRATION_PADDING_MS") {
            config.ack_expiration_padding = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("TETHER_STREAM_ACK_DEADLINE_SECONDS") {
            config.stream_ack_deadline_seconds = value as u32;
        }
        if let Some(value) = read_usize_env("TETHER_CHANNELS_PER_CORE") {
            config.channels_per_core = value;
        }
        if let Some(value) = read_u64_env("TETHER_MAX_OUTSTANDING_MESSAGES") {
            config.flow_control.max_outstanding_messages = Some(value);
        }
        if let Some(value) = read_u64_env("TETHER_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
        config
    }

    /// Rejects configurations the connection core cannot honor. Called by
    /// [`Subscriber::start`](crate::Subscriber::start) before anything spawns.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.subscription.is_empty() {
            anyhow::bail!("subscription must not be empty");
        }
        if self.ack_expiration_padding < MIN_ACK_EXPIRATION_PADDING {
            anyhow::bail!(
                "ack_expiration_padding must be at least {}s",
                MIN_ACK_EXPIRATION_PADDING.as_secs()
            );
        }
        if self.stream_ack_deadline_seconds < MIN_STREAM_ACK_DEADLINE_SECONDS
            || self.stream_ack_deadline_seconds > MAX_STREAM_ACK_DEADLINE_SECONDS
        {
            anyhow::bail!(
                "stream_ack_deadline_seconds must lie in [{MIN_STREAM_ACK_DEADLINE_SECONDS}, {MAX_STREAM_ACK_DEADLINE_SECONDS}]"
            );
        }
        if self.channels_per_core == 0 {
            anyhow::bail!("channels_per_core must be at least 1");
        }
        if self.flow_control.max_outstanding_messages == Some(0) {
            anyhow::bail!("max_outstanding_messages must be positive or unlimited");
        }
        if self.flow_control.max_outstanding_bytes == Some(0) {
            anyhow::bail!("max_outstanding_bytes must be positive or unlimited");
        }
        Ok(())
    }

    pub(crate) fn is_retryable(&self, code: StatusCode) -> bool {
        match &self.retryable_statuses {
            Some(overrides) => overrides.contains(&code),
            None => code.is_retryable(),
        }
    }
}

impl SubscriberConfigOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.ack_expiration_padding_ms
            && value > 0
        {
            config.ack_expiration_padding = Duration::from_millis(value);
        }
        if let Some(value) = self.stream_ack_deadline_seconds
            && value > 0
        {
            config.stream_ack_deadline_seconds = value;
        }
        if let Some(value) = self.channels_per_core
            && value > 0
        {
            config.channels_per_core = value;
        }
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.flow_control.max_outstanding_messages = Some(value);
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.flow_control.max_outstanding_bytes = Some(value);
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
