use crate::capability::types::{BackendLimits, Feature, ModelType, Pricing};
use crate::error::RawFailure;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Requested output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Function/tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Backend-neutral request handed to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    pub id: Uuid,
    pub prompt: String,
    pub system_message: Option<String>,
    pub response_format: ResponseFormat,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f32>,
    pub metadata: HashMap<String, String>,
}

impl Default for BackendRequest {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: String::new(),
            system_message: None,
            response_format: ResponseFormat::Text,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            metadata: HashMap::new(),
        }
    }
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub request_id: Uuid,
    pub content: String,
    pub model_used: String,
    pub tool_calls: Vec<ToolCall>,
    pub token_usage: TokenUsage,
    pub latency: Duration,
}

/// One incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFragment {
    pub index: usize,
    pub delta: String,
    pub finished: bool,
}

/// Lazy, finite sequence of fragments. Dropping it cancels the underlying call.
pub type ResponseStream = BoxStream<'static, Result<ResponseFragment, RawFailure>>;

/// Static, declared facts about a model that probing cannot measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub model_type: ModelType,
    pub context_window: u64,
    pub max_output_tokens: u64,
    pub pricing: Pricing,
    /// Features the vendor declares (multimodal input, for instance).
    pub declared_features: BTreeSet<Feature>,
}

impl ModelDescriptor {
    pub fn chat(model_id: impl Into<String>, pricing: Pricing) -> Self {
        Self {
            model_id: model_id.into(),
            model_type: ModelType::Chat,
            context_window: 128_000,
            max_output_tokens: 4_096,
            pricing,
            declared_features: BTreeSet::new(),
        }
    }

    pub fn with_context_window(mut self, context_window: u64) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn with_declared_feature(mut self, feature: Feature) -> Self {
        self.declared_features.insert(feature);
        self
    }
}

/// Backend-level declared profile: limits, attestations and advertised SLA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    pub limits: BackendLimits,
    pub certifications: BTreeSet<String>,
    /// Advertised availability in [0, 1], if the vendor publishes one.
    pub advertised_uptime: Option<f64>,
}

impl BackendProfile {
    pub fn with_certification(mut self, certification: impl Into<String>) -> Self {
        self.certifications.insert(certification.into());
        self
    }

    pub fn with_limits(mut self, limits: BackendLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_advertised_uptime(mut self, uptime: f64) -> Self {
        self.advertised_uptime = Some(uptime.clamp(0.0, 1.0));
        self
    }
}

/// Individual functional test in the capability battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProbeKind {
    Streaming,
    StructuredOutput,
    SystemMessage,
    ToolCalling,
    Latency,
}

impl ProbeKind {
    pub const BATTERY: [ProbeKind; 5] = [
        ProbeKind::Streaming,
        ProbeKind::StructuredOutput,
        ProbeKind::SystemMessage,
        ProbeKind::ToolCalling,
        ProbeKind::Latency,
    ];

    /// Feature a passing test demonstrates, if any.
    pub fn feature(self) -> Option<Feature> {
        match self {
            ProbeKind::Streaming => Some(Feature::Streaming),
            ProbeKind::StructuredOutput => Some(Feature::StructuredOutput),
            ProbeKind::SystemMessage => Some(Feature::SystemMessages),
            ProbeKind::ToolCalling => Some(Feature::ToolCalling),
            ProbeKind::Latency => None,
        }
    }
}

/// Result of an adapter-native probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Supported,
    Unsupported,
}
