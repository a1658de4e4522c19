//! gRPC interceptors for trace context and request correlation.

use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tonic::metadata::{KeyRef, MetadataMap, MetadataValue};
use tonic::{Request, Status};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|k| match k {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

/// Interceptor that links the handler span to the caller's W3C trace context
/// and guarantees every request carries an `x-request-id`.
///
/// ```ignore
/// let svc = VoucherServiceServer::with_interceptor(service, trace_context_interceptor);
/// ```
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(mut request: Request<()>) -> Result<Request<()>, Status> {
    let context = TraceContextPropagator::new().extract(&MetadataExtractor(request.metadata()));
    Span::current().set_parent(context);

    if let Some(traceparent) = request.metadata().get(TRACEPARENT_KEY)
        && let Ok(value) = traceparent.to_str()
    {
        tracing::debug!(traceparent = %value, "gRPC request with trace context");
    }

    if extract_request_id(&request).is_none()
        && let Ok(value) = MetadataValue::try_from(uuid::Uuid::new_v4().to_string())
    {
        request.metadata_mut().insert(REQUEST_ID_KEY, value);
    }

    Ok(request)
}

/// Extract request ID from incoming gRPC request metadata.
pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
