//! Voucher Service - group-scoped custody of device serials and domain
//! certificates, and RFC 8366 ownership voucher issuance.

pub mod config;
pub mod grpc;
pub mod models;
pub mod services;
pub mod startup;
