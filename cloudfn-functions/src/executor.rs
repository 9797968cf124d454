//! Subprocess execution of materialized functions
//!
//! Each invocation gets its own scratch directory (named after the function
//! ID and a fresh invocation ID) holding the generated program and any build
//! output. The directory is removed when the invocation ends, so concurrent
//! invocations of one function never share files. The registry's copy of the
//! source is never touched here.
//!
//! Children run in their own process group. When the deadline passes the
//! whole group is killed, not just the direct child.

use cloudfn_core::InvocationId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::function::{Function, Runtime};
use crate::invocation::{ExecuteRequest, InvocationError, ProcessOutput};
use crate::materialize::{materialize, Program, CONTEXT_ENV, EVENT_ENV};

/// Name of the binary produced by the build step of compiled runtimes
const BINARY_NAME: &str = "function";

/// How long output pipes may stay open after the direct child exits
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Process executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Parent of the per-invocation scratch directories
    pub scratch_dir: PathBuf,
    /// Maximum number of invocations running at once
    pub max_concurrent: usize,
    pub go_binary: String,
    pub node_binary: String,
    pub python_binary: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("cloudfn"),
            max_concurrent: 10,
            go_binary: "go".to_string(),
            node_binary: "node".to_string(),
            python_binary: "python3".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Toolchain command for a runtime: compiler for Go, interpreter otherwise
    pub fn toolchain(&self, runtime: Runtime) -> &str {
        match runtime {
            Runtime::Go => &self.go_binary,
            Runtime::Nodejs => &self.node_binary,
            Runtime::Python => &self.python_binary,
        }
    }
}

/// Runs functions as child processes under a deadline
pub struct ProcessExecutor {
    config: ExecutorConfig,
    limiter: Arc<Semaphore>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            config,
            limiter: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Free execution slots right now
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Materialize, build if needed, and run one invocation
    ///
    /// The deadline starts when the call is made and covers waiting for a
    /// free slot, the build and the run.
    pub async fn execute(
        &self,
        function: &Function,
        request: &ExecuteRequest,
    ) -> Result<ProcessOutput, InvocationError> {
        let timeout = Duration::from_secs(function.timeout);
        let deadline = Instant::now() + timeout;

        let _permit = match tokio::time::timeout_at(deadline, self.limiter.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => {
                return Err(InvocationError::Spawn(format!("executor shut down: {e}")));
            }
            Err(_) => {
                warn!(
                    function_id = %function.id,
                    timeout_secs = function.timeout,
                    "Timed out waiting for an execution slot"
                );
                return Err(InvocationError::Timeout(timeout));
            }
        };

        let invocation_id = InvocationId::new();

        let arena = self.create_arena(function, &invocation_id).await?;
        let program = materialize(function);
        tokio::fs::write(arena.path().join(program.file_name), &program.source).await?;

        debug!(
            function_id = %function.id,
            invocation_id = %invocation_id,
            runtime = %function.runtime,
            dir = %arena.path().display(),
            "Materialized function"
        );

        let env = invocation_env(function, request);

        let mut command = if function.runtime.is_compiled() {
            self.build(function, &program, arena.path(), &env, deadline, timeout)
                .await?;
            Command::new(arena.path().join(BINARY_NAME))
        } else {
            let mut command = Command::new(self.config.toolchain(function.runtime));
            command.arg(program.file_name);
            command
        };
        command.current_dir(arena.path()).envs(env);

        let output = match run_until(command, deadline, timeout).await {
            Ok(output) => output,
            Err(e) => {
                if e.is_timeout() {
                    warn!(
                        function_id = %function.id,
                        invocation_id = %invocation_id,
                        timeout_secs = function.timeout,
                        "Function execution timed out"
                    );
                }
                return Err(e);
            }
        };

        if !output.stderr.trim().is_empty() {
            if output.succeeded() {
                debug!(invocation_id = %invocation_id, stderr = %output.stderr, "Function stderr");
            } else {
                warn!(invocation_id = %invocation_id, stderr = %output.stderr, "Function stderr");
            }
        }

        info!(
            function_id = %function.id,
            invocation_id = %invocation_id,
            exit_code = ?output.exit_code,
            "Function process finished"
        );

        drop(arena);
        Ok(output)
    }

    async fn create_arena(
        &self,
        function: &Function,
        invocation_id: &InvocationId,
    ) -> Result<tempfile::TempDir, InvocationError> {
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let arena = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", function.id, invocation_id.short()))
            .tempdir_in(&self.config.scratch_dir)?;
        Ok(arena)
    }

    async fn build(
        &self,
        function: &Function,
        program: &Program,
        dir: &Path,
        env: &[(String, String)],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), InvocationError> {
        let mut command = Command::new(self.config.toolchain(function.runtime));
        command
            .args(["build", "-o", BINARY_NAME, program.file_name])
            .current_dir(dir)
            .envs(env.iter().cloned());

        debug!(function_id = %function.id, "Building function");
        let output = run_until(command, deadline, timeout).await?;

        if output.succeeded() {
            return Ok(());
        }

        let detail = if output.stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        warn!(function_id = %function.id, detail = %detail, "Function build failed");
        Err(InvocationError::Build(detail))
    }
}

/// Environment added on top of the inherited one
///
/// The function's declared variables come last and win over
/// `FUNCTION_EVENT`/`FUNCTION_CONTEXT` and anything inherited.
pub fn invocation_env(function: &Function, request: &ExecuteRequest) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(function.environment.len() + 2);
    env.push((EVENT_ENV.to_string(), request.event_json()));
    env.push((CONTEXT_ENV.to_string(), request.context_json()));
    env.extend(
        function
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    env
}

/// Spawn `command` in a new process group and collect its output
///
/// Completion is the exit of the direct child. Anything it left running in
/// its group is killed then, so background descendants holding the output
/// pipes cannot stall the invocation.
async fn run_until(
    mut command: Command,
    deadline: Instant,
    timeout: Duration,
) -> Result<ProcessOutput, InvocationError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| InvocationError::Spawn(e.to_string()))?;
    let pgid = child.id();

    let stdout = PipeReader::spawn(child.stdout.take());
    let stderr = PipeReader::spawn(child.stderr.take());

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
            return Err(e.into());
        }
        Err(_) => {
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
            return Err(InvocationError::Timeout(timeout));
        }
    };

    if let Some(pgid) = pgid {
        kill_process_group(pgid);
    }

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: stdout.finish().await,
        stderr: String::from_utf8_lossy(&stderr.finish().await).into_owned(),
    })
}

/// Background reader for one child pipe
///
/// The task is aborted when the reader is dropped.
struct PipeReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buffer, task }
    }

    /// Wait up to `DRAIN_GRACE` for end of file, then take what was read
    async fn finish(mut self) -> Vec<u8> {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };

    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed process group"),
        Err(Errno::ESRCH) => debug!(pgid, "Process group already exited"),
        Err(e) => warn!(pgid, error = %e, "Failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::decode_output;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn has_toolchain(binary: &str, arg: &str) -> bool {
        std::process::Command::new(binary)
            .arg(arg)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn has_python() -> bool {
        has_toolchain("python3", "--version")
    }

    fn executor(max_concurrent: usize) -> (ProcessExecutor, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = ExecutorConfig {
            scratch_dir: tmp.path().join("scratch"),
            max_concurrent,
            ..Default::default()
        };
        (ProcessExecutor::new(config), tmp)
    }

    fn registered(mut function: Function) -> Function {
        function.id = "fn_test".to_string();
        function
    }

    fn python(code: &str, handler: &str) -> Function {
        registered(Function::new("test", Runtime::Python, code, handler))
    }

    const ADD_PY: &str = "def add(e, c):\n    return {'sum': e['a'] + e['b']}\n";

    #[test]
    fn test_invocation_env_order() {
        let function = python(ADD_PY, "add").with_environment(HashMap::from([(
            "FUNCTION_EVENT".to_string(),
            "shadowed".to_string(),
        )]));
        let env = invocation_env(&function, &ExecuteRequest::new(json!({"a": 1})));

        assert_eq!(env[0], ("FUNCTION_EVENT".to_string(), r#"{"a":1}"#.to_string()));
        assert_eq!(env[1], ("FUNCTION_CONTEXT".to_string(), "{}".to_string()));
        assert_eq!(env.last().unwrap().1, "shadowed");
    }

    #[tokio::test]
    async fn test_python_add() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);

        let output = executor
            .execute(&python(ADD_PY, "add"), &ExecuteRequest::new(json!({"a": 2, "b": 3})))
            .await
            .unwrap();

        let decoded = decode_output(&output);
        assert!(decoded.failure.is_none(), "{:?}", decoded.failure);
        assert_eq!(decoded.result, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_scratch_directory_is_removed() {
        if !has_python() {
            return;
        }
        let (executor, tmp) = executor(4);

        executor
            .execute(&python(ADD_PY, "add"), &ExecuteRequest::new(json!({"a": 1, "b": 1})))
            .await
            .unwrap();

        let leftovers = std::fs::read_dir(tmp.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_environment_and_context_reach_handler() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "import os\n\ndef handler(event, context):\n    return {'greeting': os.environ['GREETING'], 'user': context.get('user'), 'event': event}\n";
        let function = python(code, "handler").with_environment(HashMap::from([(
            "GREETING".to_string(),
            "hello".to_string(),
        )]));
        let request = ExecuteRequest::default()
            .with_context(HashMap::from([("user".to_string(), "ada".to_string())]));

        let output = executor.execute(&function, &request).await.unwrap();

        let decoded = decode_output(&output);
        assert_eq!(
            decoded.result,
            json!({"greeting": "hello", "user": "ada", "event": null})
        );
    }

    #[tokio::test]
    async fn test_user_prints_do_not_corrupt_result() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "print('module loaded')\n\ndef handler(event, context):\n    print('noisy')\n    return 42\n";

        let output = executor
            .execute(&python(code, "handler"), &ExecuteRequest::default())
            .await
            .unwrap();

        assert!(output.stderr.contains("noisy"));
        assert_eq!(decode_output(&output).result, json!(42));
    }

    #[tokio::test]
    async fn test_missing_handler_is_structured_error() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);

        let output = executor
            .execute(&python(ADD_PY, "subtract"), &ExecuteRequest::default())
            .await
            .unwrap();

        let decoded = decode_output(&output);
        match decoded.failure {
            Some(InvocationError::Handler(message)) => assert!(message.contains("subtract")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_exception_is_structured_error() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "def boom(event, context):\n    raise ValueError('bad input')\n";

        let output = executor
            .execute(&python(code, "boom"), &ExecuteRequest::default())
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(1));
        assert!(output.stderr.contains("Traceback"));
        match decode_output(&output).failure {
            Some(InvocationError::Handler(message)) => assert_eq!(message, "bad input"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_returns_promptly() {
        if !has_python() {
            return;
        }
        let (executor, tmp) = executor(4);
        let code = "import time\n\ndef slow(event, context):\n    time.sleep(5)\n    return 'done'\n";
        let function = python(code, "slow").with_timeout(1);

        let started = std::time::Instant::now();
        let result = executor.execute(&function, &ExecuteRequest::default()).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(InvocationError::Timeout(_))));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

        let leftovers = std::fs::read_dir(tmp.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        if !has_python() {
            return;
        }
        let (executor, tmp) = executor(4);
        let pid_file = tmp.path().join("grandchild.pid");
        let code = "import os, subprocess, time\n\ndef spawn(event, context):\n    child = subprocess.Popen(['sleep', '30'])\n    with open(os.environ['PID_FILE'], 'w') as f:\n        f.write(str(child.pid))\n    time.sleep(30)\n";
        let function = python(code, "spawn")
            .with_timeout(1)
            .with_environment(HashMap::from([(
                "PID_FILE".to_string(),
                pid_file.display().to_string(),
            )]));

        let result = executor.execute(&function, &ExecuteRequest::default()).await;
        assert!(matches!(result, Err(InvocationError::Timeout(_))));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));

        // Gone, or a zombie waiting for init to reap it
        let mut alive = true;
        for _ in 0..40 {
            match std::fs::read_to_string(&stat) {
                Err(_) => alive = false,
                Ok(s) if s.contains(") Z ") => alive = false,
                Ok(_) => {}
            }
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "grandchild {pid} survived the timeout");
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_isolated() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);
        let function = python(ADD_PY, "add");

        let first = ExecuteRequest::new(json!({"a": 2, "b": 3}));
        let second = ExecuteRequest::new(json!({"a": 10, "b": 20}));
        let (a, b) = tokio::join!(
            executor.execute(&function, &first),
            executor.execute(&function, &second),
        );

        assert_eq!(decode_output(&a.unwrap()).result, json!({"sum": 5}));
        assert_eq!(decode_output(&b.unwrap()).result, json!({"sum": 30}));
    }

    #[tokio::test]
    async fn test_concurrency_limit_serializes_runs() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(1);
        let code = "import time\n\ndef nap(event, context):\n    time.sleep(0.5)\n    return event\n";
        let function = python(code, "nap");
        let request = ExecuteRequest::default();

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            executor.execute(&function, &request),
            executor.execute(&function, &request),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(executor.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_waiting_for_a_slot_counts_against_the_deadline() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(1);
        let hog = python(
            "import time\n\ndef hog(event, context):\n    time.sleep(4)\n    return 'done'\n",
            "hog",
        )
        .with_timeout(10);
        let quick = python(ADD_PY, "add").with_timeout(1);
        let request = ExecuteRequest::new(json!({"a": 1, "b": 1}));

        let (hogged, queued) = tokio::join!(executor.execute(&hog, &request), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let started = std::time::Instant::now();
            let result = executor.execute(&quick, &request).await;
            (result, started.elapsed())
        });

        let (result, elapsed) = queued;
        assert!(matches!(result, Err(InvocationError::Timeout(_))));
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
        assert!(hogged.is_ok());
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_invocation_open() {
        if !has_python() {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "import subprocess\n\ndef detach(event, context):\n    subprocess.Popen(['sleep', '3'])\n    return 'started'\n";
        let function = python(code, "detach").with_timeout(2);

        let started = std::time::Instant::now();
        let output = executor
            .execute(&function, &ExecuteRequest::default())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        let decoded = decode_output(&output);
        assert!(decoded.failure.is_none(), "{:?}", decoded.failure);
        assert_eq!(decoded.result, json!("started"));
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_process_group_signals_the_group() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();

        kill_process_group(child.id());

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));

        // Signalling a group that is gone is not an error
        kill_process_group(child.id());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let executor = ProcessExecutor::new(ExecutorConfig {
            scratch_dir: tmp.path().to_path_buf(),
            python_binary: "cloudfn-no-such-python".to_string(),
            ..Default::default()
        });

        let result = executor
            .execute(&python(ADD_PY, "add"), &ExecuteRequest::default())
            .await;
        assert!(matches!(result, Err(InvocationError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_node_add() {
        if !has_toolchain("node", "--version") {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "function add(event, context) {\n  return { sum: event.a + event.b };\n}\n";
        let function = registered(Function::new("add", Runtime::Nodejs, code, "add"));

        let output = executor
            .execute(&function, &ExecuteRequest::new(json!({"a": 2, "b": 3})))
            .await
            .unwrap();

        assert_eq!(decode_output(&output).result, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_go_add() {
        if !has_toolchain("go", "version") {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "func add(event interface{}, context map[string]string) interface{} {\n\tm := event.(map[string]interface{})\n\treturn map[string]interface{}{\"sum\": m[\"a\"].(float64) + m[\"b\"].(float64)}\n}\n";
        let function = registered(Function::new("add", Runtime::Go, code, "add")).with_timeout(120);

        let output = executor
            .execute(&function, &ExecuteRequest::new(json!({"a": 2, "b": 3})))
            .await
            .unwrap();

        assert_eq!(decode_output(&output).result, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_go_undeclared_handler_is_build_error() {
        if !has_toolchain("go", "version") {
            return;
        }
        let (executor, _tmp) = executor(4);
        let code = "func add(event interface{}, context map[string]string) interface{} { return nil }\n";
        let function =
            registered(Function::new("add", Runtime::Go, code, "missing")).with_timeout(120);

        let result = executor.execute(&function, &ExecuteRequest::default()).await;
        assert!(matches!(result, Err(InvocationError::Build(_))));
    }
}
