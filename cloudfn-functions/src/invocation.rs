//! Invocation requests, outcomes and result decoding

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Execution-level failures
///
/// These never surface as transport errors: they are folded into an
/// [`ExecuteResponse`] with `success = false`.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("Build failed: {0}")]
    Build(String),

    #[error("Process exited with {status}: {detail}")]
    Runtime { status: String, detail: String },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Function timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Failed to start process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InvocationError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Runtime { .. } => "runtime",
            Self::Handler(_) => "handler",
            Self::Timeout(_) => "timeout",
            Self::Spawn(_) => "spawn",
            Self::Io(_) => "io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Invocation payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ExecuteRequest {
    pub fn new(event: Value) -> Self {
        Self {
            event: Some(event),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }

    /// `FUNCTION_EVENT` value: the JSON text of the event, empty if absent
    pub fn event_json(&self) -> String {
        match &self.event {
            Some(event) => event.to_string(),
            None => String::new(),
        }
    }

    /// `FUNCTION_CONTEXT` value: the JSON text of the context map
    pub fn context_json(&self) -> String {
        serde_json::to_string(&self.context).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock milliseconds
    pub duration: u64,
}

impl ExecuteResponse {
    pub fn success(result: Value, duration: Duration) -> Self {
        Self {
            success: true,
            result,
            error: None,
            duration: millis(duration),
        }
    }

    pub fn failure(error: &InvocationError, result: Value, duration: Duration) -> Self {
        Self {
            success: false,
            result,
            error: Some(error.to_string()),
            duration: millis(duration),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What a finished child process left behind
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn status_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "signal".to_string(),
        }
    }
}

/// A decoded invocation: the result value plus the failure, if any
#[derive(Debug)]
pub struct Decoded {
    pub result: Value,
    pub failure: Option<InvocationError>,
}

/// Decode raw stdout as JSON, falling back to the raw (trimmed) text
pub fn decode_stdout(stdout: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(stdout) {
        Ok(value) => value,
        Err(_) => {
            let text = String::from_utf8_lossy(stdout);
            let text = text.trim();
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text.to_string())
            }
        }
    }
}

/// Interpret a finished process
///
/// Unwraps the wrapper's `{"success", "result"|"error"}` envelope. Output
/// that is not an envelope is the bare result; whether it counts as success
/// follows the exit status.
pub fn decode_output(output: &ProcessOutput) -> Decoded {
    let value = decode_stdout(&output.stdout);

    if let Some(envelope) = Envelope::from_value(&value) {
        return match envelope {
            Envelope::Success(result) if output.succeeded() => Decoded {
                result,
                failure: None,
            },
            Envelope::Success(result) => Decoded {
                result,
                failure: Some(runtime_failure(output)),
            },
            Envelope::Failure(message) => Decoded {
                result: Value::Null,
                failure: Some(InvocationError::Handler(message)),
            },
        };
    }

    if output.succeeded() {
        Decoded {
            result: value,
            failure: None,
        }
    } else {
        Decoded {
            result: value,
            failure: Some(runtime_failure(output)),
        }
    }
}

fn runtime_failure(output: &ProcessOutput) -> InvocationError {
    let stderr = output.stderr.trim();
    let detail = if stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.to_string()
    };

    InvocationError::Runtime {
        status: output.status_label(),
        detail: if detail.is_empty() {
            "no output".to_string()
        } else {
            detail
        },
    }
}

enum Envelope {
    Success(Value),
    Failure(String),
}

impl Envelope {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.get("success")?.as_bool()? {
            return Some(Self::Success(
                object.get("result").cloned().unwrap_or(Value::Null),
            ));
        }

        let message = match object.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => "function reported failure".to_string(),
        };
        Some(Self::Failure(message))
    }
}
