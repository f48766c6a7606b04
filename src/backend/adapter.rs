use crate::backend::types::{
    BackendProfile, BackendRequest, BackendResponse, ModelDescriptor, ProbeKind, ProbeOutcome,
    ResponseFragment, ResponseStream,
};
use crate::error::RawFailure;
use futures::future::BoxFuture;
use futures::stream;

/// Contract every backend integration satisfies to take part in dispatch.
///
/// Wire protocol, authentication and payload mapping live entirely inside the
/// implementation.
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier used as the key for breakers, metrics and capabilities.
    fn backend_id(&self) -> &str;

    /// Execute a single request against one model.
    fn invoke(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<BackendResponse, RawFailure>>;

    /// Start a streamed response.
    ///
    /// The default buffers `invoke` into a single fragment, which the
    /// capability probe correctly reports as non-streaming.
    fn stream(
        &self,
        model_id: &str,
        request: BackendRequest,
    ) -> BoxFuture<'_, Result<ResponseStream, RawFailure>> {
        let model_id = model_id.to_string();
        Box::pin(async move {
            let response = self.invoke(&model_id, request).await?;
            let fragment = ResponseFragment {
                index: 0,
                delta: response.content,
                finished: true,
            };
            let stream: ResponseStream = Box::pin(stream::iter(vec![Ok(fragment)]));
            Ok(stream)
        })
    }

    /// Models this backend can serve, with their declared attributes.
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<ModelDescriptor>, RawFailure>>;

    /// Backend-level declared limits, certifications and SLA.
    fn profile(&self) -> BackendProfile {
        BackendProfile::default()
    }

    /// Native probe for one test kind.
    ///
    /// `None` means the generic battery built on `invoke`/`stream` is used.
    fn probe(
        &self,
        _model_id: &str,
        _kind: ProbeKind,
    ) -> Option<BoxFuture<'_, Result<ProbeOutcome, RawFailure>>> {
        None
    }
}
