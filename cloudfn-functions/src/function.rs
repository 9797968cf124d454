//! Function models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Timeout applied when a create request does not name one (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Memory recorded when a create request does not name one (MB)
pub const DEFAULT_MEMORY_MB: u32 = 128;

/// Supported function runtimes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Compiled with the Go toolchain, then run as a native binary
    Go,
    /// Interpreted by Node.js
    Nodejs,
    /// Interpreted by CPython 3
    Python,
}

impl Runtime {
    /// Every runtime the materializer knows how to wrap
    pub const ALL: [Runtime; 3] = [Runtime::Go, Runtime::Nodejs, Runtime::Python];

    /// Parse runtime string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "go" => Some(Self::Go),
            "nodejs" => Some(Self::Nodejs),
            "python" => Some(Self::Python),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Nodejs => "nodejs",
            Self::Python => "python",
        }
    }

    /// File name of the canonical source copy and of the materialized program
    pub fn source_file(&self) -> &'static str {
        match self {
            Self::Go => "main.go",
            Self::Nodejs => "index.js",
            Self::Python => "main.py",
        }
    }

    /// Whether the program needs a build step before it can run
    pub fn is_compiled(&self) -> bool {
        matches!(self, Self::Go)
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored function definition
///
/// `id`, `created_at` and `updated_at` are owned by the registry: whatever a
/// caller puts there is overwritten on create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub runtime: Runtime,
    pub code: String,
    pub handler: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Seconds, always > 0
    pub timeout: u64,
    /// MB. Recorded but not enforced.
    pub memory: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Function {
    /// Create an unregistered function with default limits
    pub fn new(
        name: impl Into<String>,
        runtime: Runtime,
        code: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            runtime,
            code: code.into(),
            handler: handler.into(),
            environment: HashMap::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            memory: DEFAULT_MEMORY_MB,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory(mut self, memory: u32) -> Self {
        self.memory = memory;
        self
    }
}
