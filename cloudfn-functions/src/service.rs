//! Function service implementation
//!
//! Validates management requests, merges partial updates, and runs
//! invocations. Registry reads are released before any process work starts.

use cloudfn_core::{ApiError, ErrorCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::ProcessExecutor;
use crate::function::{Function, Runtime, DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SECS};
use crate::invocation::{decode_output, ExecuteRequest, ExecuteResponse};
use crate::materialize::is_valid_handler;
use crate::metrics::Metrics;
use crate::registry::{FunctionRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum FunctionServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("Unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("{0}")]
    Persistence(String),
}

impl FunctionServiceError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::UnsupportedRuntime(_) => ErrorCode::UnsupportedRuntime,
            Self::Persistence(_) => ErrorCode::PersistenceError,
        }
    }
}

impl From<RegistryError> for FunctionServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            other => Self::Persistence(other.to_string()),
        }
    }
}

impl From<FunctionServiceError> for ApiError {
    fn from(e: FunctionServiceError) -> Self {
        let code = e.error_code();
        match e {
            FunctionServiceError::NotFound(ref id) => {
                let resource = id.clone();
                ApiError::new(code, e.to_string()).with_resource(resource)
            }
            other => ApiError::new(code, other.to_string()),
        }
    }
}

/// Limits and defaults applied to management requests
#[derive(Debug, Clone)]
pub struct ServiceLimits {
    /// Seconds, used when a request omits the timeout or sends 0
    pub default_timeout: u64,
    /// MB, used when a request omits the memory or sends 0
    pub default_memory: u32,
    pub max_timeout: u64,
    pub max_code_size_kb: usize,
    pub enabled_runtimes: Vec<Runtime>,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT_SECS,
            default_memory: DEFAULT_MEMORY_MB,
            max_timeout: 900,
            max_code_size_kb: 1024,
            enabled_runtimes: Runtime::ALL.to_vec(),
        }
    }
}

/// Body of a create request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateFunctionInput {
    pub name: String,
    pub runtime: String,
    pub code: String,
    pub handler: String,
    pub environment: Option<HashMap<String, String>>,
    pub timeout: Option<u64>,
    pub memory: Option<u32>,
}

/// Body of an update request; absent, empty or zero fields keep the stored value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateFunctionInput {
    pub name: Option<String>,
    pub runtime: Option<String>,
    pub code: Option<String>,
    pub handler: Option<String>,
    pub environment: Option<HashMap<String, String>>,
    pub timeout: Option<u64>,
    pub memory: Option<u32>,
}

/// Function service managing the registry and invocations
pub struct FunctionService {
    registry: FunctionRegistry,
    executor: ProcessExecutor,
    metrics: Arc<Metrics>,
    limits: ServiceLimits,
}

impl FunctionService {
    pub fn new(
        registry: FunctionRegistry,
        executor: ProcessExecutor,
        metrics: Arc<Metrics>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            registry,
            executor,
            metrics,
            limits,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Create a new function
    pub fn create_function(
        &self,
        input: CreateFunctionInput,
    ) -> Result<Function, FunctionServiceError> {
        for (field, value) in [
            ("name", &input.name),
            ("runtime", &input.runtime),
            ("code", &input.code),
            ("handler", &input.handler),
        ] {
            if value.trim().is_empty() {
                return Err(FunctionServiceError::Validation(format!(
                    "{field} is required"
                )));
            }
        }

        let runtime = self.parse_runtime(&input.runtime)?;

        let function = Function::new(input.name, runtime, input.code, input.handler)
            .with_environment(input.environment.unwrap_or_default())
            .with_timeout(
                input
                    .timeout
                    .filter(|t| *t > 0)
                    .unwrap_or(self.limits.default_timeout),
            )
            .with_memory(
                input
                    .memory
                    .filter(|m| *m > 0)
                    .unwrap_or(self.limits.default_memory),
            );

        self.validate(&function)?;

        let created = self.registry.create(function)?;
        self.metrics.record_function_created();
        Ok(created)
    }

    /// Get a function by ID
    pub fn get_function(&self, id: &str) -> Result<Function, FunctionServiceError> {
        Ok(self.registry.get(id)?)
    }

    /// List all functions, oldest first
    pub fn list_functions(&self) -> Vec<Function> {
        let mut functions = self.registry.list();
        functions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        functions
    }

    /// Merge `input` into the stored function and replace it
    pub fn update_function(
        &self,
        id: &str,
        input: UpdateFunctionInput,
    ) -> Result<Function, FunctionServiceError> {
        let mut function = self.registry.get(id)?;

        if let Some(name) = non_empty(input.name) {
            function.name = name;
        }
        if let Some(runtime) = non_empty(input.runtime) {
            function.runtime = self.parse_runtime(&runtime)?;
        }
        if let Some(code) = non_empty(input.code) {
            function.code = code;
        }
        if let Some(handler) = non_empty(input.handler) {
            function.handler = handler;
        }
        if let Some(environment) = input.environment {
            function.environment = environment;
        }
        if let Some(timeout) = input.timeout.filter(|t| *t > 0) {
            function.timeout = timeout;
        }
        if let Some(memory) = input.memory.filter(|m| *m > 0) {
            function.memory = memory;
        }

        self.validate(&function)?;
        Ok(self.registry.update(id, function)?)
    }

    /// Delete a function
    pub fn delete_function(&self, id: &str) -> Result<(), FunctionServiceError> {
        self.registry.delete(id)?;
        self.metrics.record_function_deleted();
        Ok(())
    }

    /// Run a function once
    ///
    /// Only an unknown ID is an error; every execution failure comes back as
    /// an `ExecuteResponse` with `success == false`.
    pub async fn invoke(
        &self,
        id: &str,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, FunctionServiceError> {
        let function = self.registry.get(id)?;

        let started = Instant::now();
        let outcome = self.executor.execute(&function, &request).await;
        let duration = started.elapsed();

        let (response, error_kind) = match outcome {
            Ok(output) => {
                let decoded = decode_output(&output);
                match decoded.failure {
                    None => (ExecuteResponse::success(decoded.result, duration), None),
                    Some(error) => (
                        ExecuteResponse::failure(&error, decoded.result, duration),
                        Some(error.kind()),
                    ),
                }
            }
            Err(error) => (
                ExecuteResponse::failure(&error, Value::Null, duration),
                Some(error.kind()),
            ),
        };

        self.metrics
            .record_execution(function.runtime, duration, response.success, error_kind);

        if response.success {
            info!(
                function_id = %function.id,
                runtime = %function.runtime,
                duration_ms = response.duration,
                "Function invoked"
            );
        } else {
            warn!(
                function_id = %function.id,
                runtime = %function.runtime,
                duration_ms = response.duration,
                error = response.error.as_deref().unwrap_or_default(),
                "Function invocation failed"
            );
        }

        Ok(response)
    }

    fn parse_runtime(&self, name: &str) -> Result<Runtime, FunctionServiceError> {
        match Runtime::from_str(name) {
            Some(runtime) if self.limits.enabled_runtimes.contains(&runtime) => Ok(runtime),
            Some(_) => Err(FunctionServiceError::UnsupportedRuntime(format!(
                "{name} (disabled)"
            ))),
            None => Err(FunctionServiceError::UnsupportedRuntime(name.to_string())),
        }
    }

    fn validate(&self, function: &Function) -> Result<(), FunctionServiceError> {
        if !is_valid_handler(function.runtime, &function.handler) {
            return Err(FunctionServiceError::Validation(format!(
                "handler '{}' is not a valid {} identifier",
                function.handler, function.runtime
            )));
        }

        if function.timeout == 0 || function.timeout > self.limits.max_timeout {
            return Err(FunctionServiceError::Validation(format!(
                "timeout must be between 1 and {} seconds",
                self.limits.max_timeout
            )));
        }

        let max_bytes = self.limits.max_code_size_kb.saturating_mul(1024);
        if function.code.len() > max_bytes {
            return Err(FunctionServiceError::Validation(format!(
                "code exceeds {} KB",
                self.limits.max_code_size_kb
            )));
        }

        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn service_with(limits: ServiceLimits) -> (FunctionService, TempDir) {
        let tmp = TempDir::new().unwrap();
        let registry =
            FunctionRegistry::open(tmp.path().join("functions"), tmp.path().join("functions.json"))
                .unwrap();
        let executor = ProcessExecutor::new(ExecutorConfig {
            scratch_dir: tmp.path().join("scratch"),
            ..Default::default()
        });
        let service = FunctionService::new(registry, executor, Arc::new(Metrics::new()), limits);
        (service, tmp)
    }

    fn service() -> (FunctionService, TempDir) {
        service_with(ServiceLimits::default())
    }

    fn add_input() -> CreateFunctionInput {
        CreateFunctionInput {
            name: "adder".to_string(),
            runtime: "python".to_string(),
            code: "def add(e, c):\n    return {'sum': e['a'] + e['b']}\n".to_string(),
            handler: "add".to_string(),
            ..Default::default()
        }
    }

    fn has_python() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_create_applies_defaults() {
        let (service, _tmp) = service();

        let function = service.create_function(add_input()).unwrap();
        assert!(function.id.starts_with("fn_"));
        assert_eq!(function.timeout, 30);
        assert_eq!(function.memory, 128);
        assert!(function.environment.is_empty());

        assert_eq!(service.get_function(&function.id).unwrap(), function);
        assert_eq!(service.metrics().snapshot().created_functions, 1);
    }

    #[test]
    fn test_unsupported_runtime_creates_nothing() {
        let (service, _tmp) = service();

        let result = service.create_function(CreateFunctionInput {
            runtime: "ruby".to_string(),
            ..add_input()
        });

        assert!(matches!(result, Err(FunctionServiceError::UnsupportedRuntime(_))));
        assert!(service.list_functions().is_empty());
    }

    #[test]
    fn test_disabled_runtime_is_unsupported() {
        let (service, _tmp) = service_with(ServiceLimits {
            enabled_runtimes: vec![Runtime::Go],
            ..Default::default()
        });

        let result = service.create_function(add_input());
        assert!(matches!(result, Err(FunctionServiceError::UnsupportedRuntime(_))));
    }

    #[test]
    fn test_missing_fields_are_validation_errors() {
        let (service, _tmp) = service();

        for input in [
            CreateFunctionInput { name: String::new(), ..add_input() },
            CreateFunctionInput { code: "  ".to_string(), ..add_input() },
            CreateFunctionInput { handler: String::new(), ..add_input() },
            CreateFunctionInput { runtime: String::new(), ..add_input() },
        ] {
            let error = service.create_function(input).unwrap_err();
            assert_eq!(error.error_code(), ErrorCode::ValidationError);
        }
        assert!(service.list_functions().is_empty());
    }

    #[test]
    fn test_limits_are_enforced() {
        let (service, _tmp) = service_with(ServiceLimits {
            max_timeout: 60,
            max_code_size_kb: 1,
            ..Default::default()
        });

        let too_slow = service.create_function(CreateFunctionInput {
            timeout: Some(61),
            ..add_input()
        });
        assert!(matches!(too_slow, Err(FunctionServiceError::Validation(_))));

        let too_big = service.create_function(CreateFunctionInput {
            code: "x".repeat(2048),
            ..add_input()
        });
        assert!(matches!(too_big, Err(FunctionServiceError::Validation(_))));

        let bad_handler = service.create_function(CreateFunctionInput {
            handler: "add(); import os".to_string(),
            ..add_input()
        });
        assert!(matches!(bad_handler, Err(FunctionServiceError::Validation(_))));

        let zero_means_default = service
            .create_function(CreateFunctionInput {
                timeout: Some(0),
                ..add_input()
            })
            .unwrap();
        assert_eq!(zero_means_default.timeout, 30);
    }

    #[test]
    fn test_update_merges_present_fields() {
        let (service, _tmp) = service();
        let created = service
            .create_function(CreateFunctionInput {
                environment: Some(HashMap::from([("K".to_string(), "v".to_string())])),
                ..add_input()
            })
            .unwrap();

        let updated = service
            .update_function(
                &created.id,
                UpdateFunctionInput {
                    name: Some("renamed".to_string()),
                    code: Some(String::new()),
                    timeout: Some(5),
                    memory: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.code, created.code);
        assert_eq!(updated.timeout, 5);
        assert_eq!(updated.memory, 128);
        assert_eq!(updated.environment["K"], "v");
    }

    #[test]
    fn test_update_rejects_bad_runtime_and_keeps_record() {
        let (service, _tmp) = service();
        let created = service.create_function(add_input()).unwrap();

        let result = service.update_function(
            &created.id,
            UpdateFunctionInput {
                runtime: Some("cobol".to_string()),
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(FunctionServiceError::UnsupportedRuntime(_))));
        assert_eq!(service.get_function(&created.id).unwrap(), created);
    }

    #[test]
    fn test_unknown_ids() {
        let (service, _tmp) = service();

        assert!(matches!(
            service.get_function("fn_missing"),
            Err(FunctionServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.update_function("fn_missing", UpdateFunctionInput::default()),
            Err(FunctionServiceError::NotFound(_))
        ));
        assert!(matches!(
            service.delete_function("fn_missing"),
            Err(FunctionServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_function() {
        let (service, _tmp) = service();
        let created = service.create_function(add_input()).unwrap();

        service.delete_function(&created.id).unwrap();

        assert!(service.get_function(&created.id).is_err());
        assert_eq!(service.metrics().snapshot().deleted_functions, 1);
    }

    #[test]
    fn test_not_found_maps_to_api_error() {
        let api: ApiError = FunctionServiceError::NotFound("fn_x".to_string()).into();
        assert_eq!(api.http_status(), 404);
        assert_eq!(api.resource.as_deref(), Some("fn_x"));

        let api: ApiError = FunctionServiceError::UnsupportedRuntime("ruby".to_string()).into();
        assert_eq!(api.http_status(), 400);
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let (service, _tmp) = service();

        let result = service.invoke("fn_missing", ExecuteRequest::default()).await;
        assert!(matches!(result, Err(FunctionServiceError::NotFound(_))));
        assert_eq!(service.metrics().snapshot().function_executions, 0);
    }

    #[tokio::test]
    async fn test_invoke_records_metrics() {
        if !has_python() {
            return;
        }
        let (service, _tmp) = service();
        let created = service.create_function(add_input()).unwrap();

        let response = service
            .invoke(&created.id, ExecuteRequest::new(json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.result, json!({"sum": 5}));

        let response = service
            .invoke(&created.id, ExecuteRequest::new(json!({"a": 2})))
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("'b'"));

        let snapshot = service.metrics().snapshot();
        assert_eq!(snapshot.function_executions, 2);
        assert_eq!(snapshot.successful_executions, 1);
        assert_eq!(snapshot.errors_by_type["handler"], 1);
        assert_eq!(snapshot.runtime_usage["python"], 2);
    }

    #[tokio::test]
    async fn test_invoke_timeout() {
        if !has_python() {
            return;
        }
        let (service, _tmp) = service();
        let created = service
            .create_function(CreateFunctionInput {
                code: "import time\n\ndef slow(e, c):\n    time.sleep(5)\n".to_string(),
                handler: "slow".to_string(),
                timeout: Some(1),
                ..add_input()
            })
            .unwrap();

        let response = service
            .invoke(&created.id, ExecuteRequest::default())
            .await
            .unwrap();

        assert!(!response.success);
        assert!(response.error.unwrap().contains("timed out"));
        assert!(response.duration < 3000);
        assert_eq!(service.metrics().snapshot().errors_by_type["timeout"], 1);
    }
}
