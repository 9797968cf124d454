//! Core types for cloudfn
//!
//! This crate provides the error codes and identifiers shared by the
//! function service and the server binary.

pub mod error;
pub mod request_id;

pub use error::{ApiError, ErrorCode};
pub use request_id::InvocationId;
