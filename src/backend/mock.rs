//! Scripted in-memory adapter for tests and local development.
//!
//! Behavior is configured up front (supported features, latency, models) and
//! failures can be queued per call, which makes breaker, retry and probe
//! behavior reproducible without a network.

use crate::backend::adapter::BackendAdapter;
use crate::backend::types::{
    BackendProfile, BackendRequest, BackendResponse, ModelDescriptor, ResponseFormat,
    ResponseFragment, ResponseStream, TokenUsage, ToolCall,
};
use crate::capability::types::{Feature, Pricing};
use crate::error::RawFailure;
use futures::future::BoxFuture;
use futures::stream;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const DEFAULT_REPLY: &str = "mock reply from backend";

pub struct MockBackend {
    backend_id: String,
    models: Vec<ModelDescriptor>,
    profile: BackendProfile,
    features: BTreeSet<Feature>,
    latency: Duration,
    scripted_failures: Mutex<VecDeque<RawFailure>>,
    persistent_failure: Mutex<Option<RawFailure>>,
    list_models_failure: Mutex<Option<RawFailure>>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(backend_id: impl Into<String>) -> Self {
        let backend_id = backend_id.into();
        let default_model = ModelDescriptor::chat(format!("{}-model", backend_id), Pricing::per_1k(0.001, 0.002));
        Self {
            backend_id,
            models: vec![default_model],
            profile: BackendProfile::default(),
            features: BTreeSet::new(),
            latency: Duration::from_millis(10),
            scripted_failures: Mutex::new(VecDeque::new()),
            persistent_failure: Mutex::new(None),
            list_models_failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Support every probe-able feature.
    pub fn fully_capable(backend_id: impl Into<String>) -> Self {
        Self::new(backend_id)
            .with_feature(Feature::Streaming)
            .with_feature(Feature::StructuredOutput)
            .with_feature(Feature::SystemMessages)
            .with_feature(Feature::ToolCalling)
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn with_models(mut self, models: Vec<ModelDescriptor>) -> Self {
        self.models = models;
        self
    }

    pub fn with_profile(mut self, profile: BackendProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue failures returned by the next calls, in order.
    pub fn fail_next(&self, failures: impl IntoIterator<Item = RawFailure>) {
        self.lock_script().extend(failures);
    }

    /// Fail every call until cleared with `None`.
    pub fn set_persistent_failure(&self, failure: Option<RawFailure>) {
        *self.persistent_failure.lock().unwrap_or_else(|p| p.into_inner()) = failure;
    }

    pub fn set_list_models_failure(&self, failure: Option<RawFailure>) {
        *self.list_models_failure.lock().unwrap_or_else(|p| p.into_inner()) = failure;
    }

    /// Calls that reached this backend (`invoke` and `stream`).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<RawFailure>> {
        self.scripted_failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_failure(&self) -> Option<RawFailure> {
        if let Some(failure) = self.lock_script().pop_front() {
            return Some(failure);
        }
        self.persistent_failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn respond(&self, model_id: &str, request: &BackendRequest) -> BackendResponse {
        let content = match (&request.system_message, request.response_format) {
            (_, ResponseFormat::Json) if self.features.contains(&Feature::StructuredOutput) => {
                serde_json::json!({ "status": "ok", "backend": self.backend_id }).to_string()
            }
            (Some(system), _) if self.features.contains(&Feature::SystemMessages) => system
                .split_whitespace()
                .last()
                .unwrap_or_default()
                .to_string(),
            _ => DEFAULT_REPLY.to_string(),
        };

        let tool_calls = match request.tools.first() {
            Some(tool) if self.features.contains(&Feature::ToolCalling) => vec![ToolCall {
                name: tool.name.clone(),
                arguments: serde_json::json!({}),
            }],
            _ => Vec::new(),
        };

        let input_tokens = request.prompt.split_whitespace().count() as u64;
        let output_tokens = content.split_whitespace().count() as u64;
        BackendResponse {
            request_id: request.id,
            content,
            model_used: model_id.to_string(),
            tool_calls,
            token_usage: TokenUsage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                estimated_cost: 0.0,
            },
            latency: self.latency,
        }
    }
}

impl BackendAdapter for MockBackend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn invoke(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<BackendResponse, RawFailure>> {
        let model_id = model_id.to_string();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if let Some(failure) = self.next_failure() {
                return Err(failure);
            }
            Ok(self.respond(&model_id, &request))
        })
    }

    fn stream(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<ResponseStream, RawFailure>> {
        let model_id = model_id.to_string();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if let Some(failure) = self.next_failure() {
                return Err(failure);
            }
            let content = self.respond(&model_id, &request).content;
            let pieces: Vec<String> = if self.features.contains(&Feature::Streaming) {
                content.split_inclusive(' ').map(str::to_string).collect()
            } else {
                vec![content]
            };
            let last = pieces.len().saturating_sub(1);
            let fragments: Vec<Result<ResponseFragment, RawFailure>> = pieces
                .into_iter()
                .enumerate()
                .map(|(index, delta)| {
                    Ok(ResponseFragment {
                        index,
                        delta,
                        finished: index == last,
                    })
                })
                .collect();
            let stream: ResponseStream = Box::pin(stream::iter(fragments));
            Ok(stream)
        })
    }

    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelDescriptor>, RawFailure>> {
        Box::pin(async move {
            let failure = self
                .list_models_failure
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            match failure {
                Some(failure) => Err(failure),
                None => Ok(self.models.clone()),
            }
        })
    }

    fn profile(&self) -> BackendProfile {
        self.profile.clone()
    }
}
