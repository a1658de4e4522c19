//! gRPC utilities for micros microservices.
//!
//! - Error conversion between `AppError` and `tonic::Status`
//! - Interceptors for trace context propagation
//! - Server construction and reflection

pub mod error;
pub mod interceptors;
pub mod server;

pub use error::IntoStatus;
pub use interceptors::{REQUEST_ID_KEY, extract_request_id, trace_context_interceptor};
pub use server::{GrpcServerBuilder, bind_listener, create_reflection_service};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
