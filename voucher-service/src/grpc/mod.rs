//! gRPC module for voucher-service.

pub mod identity;
mod service;

pub use service::VoucherServiceImpl;
pub use service_core::grpc::trace_context_interceptor;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("micros.voucher.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("voucher_descriptor");
}
