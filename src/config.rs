//! Runtime configuration.
//!
//! All settings are plain serde structs so they can be loaded from JSON and
//! then adjusted in code with the `with_*` builders. Durations are stored as
//! milliseconds and exposed through `Duration` accessors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::BusError;

/// Process-wide node identity, minted once when the settings are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn generate() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        NodeId(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    pub uri: Url,
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_parallelism")]
    pub maximum_parallel_messages: usize,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub use_for_replies: bool,
}

fn default_parallelism() -> usize {
    5
}

impl ListenerSettings {
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            durable: false,
            maximum_parallel_messages: default_parallelism(),
            sequential: false,
            use_for_replies: false,
        }
    }

    /// Parse the listener address from a string.
    pub fn parse(uri: &str) -> Result<Self, BusError> {
        Ok(Self::new(Url::parse(uri)?))
    }

    /// Persist every accepted envelope before acknowledging the batch.
    pub fn durably_persisted(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn maximum_parallel(mut self, count: usize) -> Self {
        self.maximum_parallel_messages = count.max(1);
        self
    }

    /// Execute one envelope at a time in arrival order.
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Advertise this listener as the node's reply address.
    pub fn use_for_replies(mut self) -> Self {
        self.use_for_replies = true;
        self
    }

    /// A listener is durable when configured so or when its address says so.
    pub fn is_durable(&self) -> bool {
        self.durable || crate::envelope::UriExt::is_durable(&self.uri)
    }

    pub fn parallelism(&self) -> usize {
        if self.sequential {
            1
        } else {
            self.maximum_parallel_messages.max(1)
        }
    }
}

/// Polling cadence and limits for the resiliency agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilitySettings {
    pub scheduled_job_polling_ms: u64,
    pub recovery_polling_ms: u64,
    pub dormant_node_polling_ms: u64,
    /// A node whose heartbeat is older than this is treated as dormant.
    pub dormant_node_threshold_ms: u64,
    pub reconnect_delay_ms: u64,
    pub recovery_batch_size: usize,
    /// Incoming recovery is skipped while local queues hold more than this.
    pub max_local_queued: usize,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            scheduled_job_polling_ms: 5_000,
            recovery_polling_ms: 5_000,
            dormant_node_polling_ms: 10_000,
            dormant_node_threshold_ms: 60_000,
            reconnect_delay_ms: 2_000,
            recovery_batch_size: 100,
            max_local_queued: 10_000,
        }
    }
}

impl DurabilitySettings {
    pub fn scheduled_job_polling(&self) -> Duration {
        Duration::from_millis(self.scheduled_job_polling_ms)
    }

    pub fn recovery_polling(&self) -> Duration {
        Duration::from_millis(self.recovery_polling_ms)
    }

    pub fn dormant_node_polling(&self) -> Duration {
        Duration::from_millis(self.dormant_node_polling_ms)
    }

    pub fn dormant_node_threshold(&self) -> Duration {
        Duration::from_millis(self.dormant_node_threshold_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Zero intervals would spin the resiliency agent.
    pub fn validate(&self) -> Result<(), BusError> {
        let intervals = [
            ("scheduled_job_polling_ms", self.scheduled_job_polling_ms),
            ("recovery_polling_ms", self.recovery_polling_ms),
            ("dormant_node_polling_ms", self.dormant_node_polling_ms),
            ("dormant_node_threshold_ms", self.dormant_node_threshold_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(BusError::Configuration(format!("durability.{name} must be > 0")));
            }
        }
        if self.recovery_batch_size == 0 {
            return Err(BusError::Configuration(
                "durability.recovery_batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Set every polling interval at once; handy for tests.
    pub fn with_polling(mut self, interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        self.scheduled_job_polling_ms = ms;
        self.recovery_polling_ms = ms;
        self.dormant_node_polling_ms = ms;
        self
    }

    pub fn with_dormant_threshold(mut self, threshold: Duration) -> Self {
        self.dormant_node_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Static publishing rule: every message of `message_type` goes to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishingRule {
    pub message_type: String,
    pub destination: Url,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Top-level settings for one messaging node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub service_name: String,
    #[serde(skip, default = "NodeId::generate")]
    pub node_id: NodeId,
    /// Handler and delivery attempt ceiling before an envelope is dead-lettered.
    pub max_attempts: u32,
    pub max_batch_size: usize,
    pub batch_flush_ms: u64,
    /// Capacity of each bounded stage channel.
    pub stage_capacity: usize,
    pub failures_before_latch: u32,
    pub ping_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub metrics_sampling_interval_ms: u64,
    pub listeners: Vec<ListenerSettings>,
    pub publishing: Vec<PublishingRule>,
    /// Message types enqueued locally through the durable loopback queue.
    pub durable_local_message_types: Vec<String>,
    pub durability: DurabilitySettings,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            service_name: "durable-bus".to_string(),
            node_id: NodeId::generate(),
            max_attempts: 3,
            max_batch_size: 200,
            batch_flush_ms: 100,
            stage_capacity: 1024,
            failures_before_latch: 3,
            ping_interval_ms: 1_000,
            send_timeout_ms: 10_000,
            reply_timeout_ms: 600_000,
            metrics_sampling_interval_ms: 5_000,
            listeners: Vec::new(),
            publishing: Vec::new(),
            durable_local_message_types: Vec::new(),
            durability: DurabilitySettings::default(),
        }
    }
}

impl BusSettings {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Load settings from JSON. Missing fields take their defaults and a
    /// fresh node id is generated.
    pub fn from_json(json: &str) -> Result<Self, BusError> {
        let settings: BusSettings = serde_json::from_str(json)
            .map_err(|e| BusError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.max_batch_size == 0 {
            return Err(BusError::Configuration("max_batch_size must be > 0".into()));
        }
        if self.stage_capacity == 0 {
            return Err(BusError::Configuration("stage_capacity must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(BusError::Configuration("max_attempts must be > 0".into()));
        }
        self.durability.validate()
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_listener(mut self, listener: ListenerSettings) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Route every `message_type` to `destination` without a subscription.
    pub fn publish(mut self, message_type: impl Into<String>, destination: Url) -> Self {
        self.publishing.push(PublishingRule {
            message_type: message_type.into(),
            destination,
            content_type: None,
        });
        self
    }

    pub fn with_durable_local(mut self, message_type: impl Into<String>) -> Self {
        self.durable_local_message_types.push(message_type.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_batching(mut self, max_batch_size: usize, flush: Duration) -> Self {
        self.max_batch_size = max_batch_size;
        self.batch_flush_ms = flush.as_millis() as u64;
        self
    }

    pub fn with_failures_before_latch(mut self, failures: u32) -> Self {
        self.failures_before_latch = failures;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_sampling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_durability(mut self, durability: DurabilitySettings) -> Self {
        self.durability = durability;
        self
    }

    pub fn batch_flush(&self) -> Duration {
        Duration::from_millis(self.batch_flush_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn metrics_sampling_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_sampling_interval_ms)
    }

    pub fn is_durable_local(&self, message_type: &str) -> bool {
        self.durable_local_message_types
            .iter()
            .any(|t| t == message_type)
    }
}
