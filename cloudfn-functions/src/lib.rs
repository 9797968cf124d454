//! Function registry and execution engine for cloudfn
//!
//! Stores user functions, materializes them into complete programs for the
//! Go, Node.js and Python runtimes, and runs them as child processes under a
//! deadline.

pub mod executor;
pub mod function;
pub mod handlers;
pub mod invocation;
pub mod materialize;
pub mod metrics;
pub mod registry;
pub mod service;

pub use executor::{ExecutorConfig, ProcessExecutor};
pub use function::{Function, Runtime};
pub use handlers::{router, FunctionsState};
pub use invocation::{ExecuteRequest, ExecuteResponse, InvocationError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use registry::{FileSnapshotStore, FunctionRegistry, RegistryError, SnapshotStore};
pub use service::{FunctionService, FunctionServiceError, ServiceLimits};
