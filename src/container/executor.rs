//! Script execution within containers

use std::time::Instant;

use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::models::ExecutionResult;
use crate::runtime::{ExecRequest, RuntimeGateway};

use super::handle::ContainerHandle;

/// Runs a whole script as one shell invocation inside a container
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    shell: String,
}

impl ScriptExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Execute `script` in `container`.
    ///
    /// A nonzero exit is a completed run with `success = false`; only a
    /// failing exec call yields an error result. `started` marks request
    /// acceptance and is the origin of the reported execution time.
    pub async fn execute(
        &self,
        runtime: &dyn RuntimeGateway,
        container: &ContainerHandle,
        script: &str,
        stdin: Option<&str>,
        started: Instant,
    ) -> ExecutionResult {
        let request = ExecRequest {
            command: self.command(script),
            stdin: stdin.map(str::to_string),
        };

        debug!(container_id = %container.short_id(), "Executing script");

        match runtime.exec(&container.id, &request).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.output).into_owned();
                match output.exit_code {
                    Some(code) => ExecutionResult::completed(stdout, code, started.elapsed()),
                    None => {
                        warn!(container_id = %container.short_id(), "Exec finished without an exit code");
                        SandboxError::Execution("exec finished without an exit code".into())
                            .into_result(started.elapsed())
                    }
                }
            }
            Err(e) => {
                warn!(container_id = %container.short_id(), error = %e, "Exec failed");
                SandboxError::Execution(e.to_string()).into_result(started.elapsed())
            }
        }
    }

    /// `shell -c '<script>'`, itself run by the shell so the whole script
    /// shares one process's state
    fn command(&self, script: &str) -> Vec<String> {
        vec![
            self.shell.clone(),
            "-c".to_string(),
            format!("{} -c '{}'", self.shell, quote_script(script)),
        ]
    }
}

/// Escape a script for embedding in a single-quoted shell argument
pub fn quote_script(script: &str) -> String {
    script.replace('\'', r"'\''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecOutput, MockRuntimeGateway, RuntimeError};
    use std::path::PathBuf;

    fn container() -> ContainerHandle {
        ContainerHandle::new("abc123def4567890", "alpine:latest", PathBuf::from("/tmp/ws"))
    }

    #[test]
    fn test_quote_script() {
        assert_eq!(quote_script("echo hi"), "echo hi");
        assert_eq!(quote_script("echo 'hi'"), r"echo '\''hi'\''");
    }

    #[test]
    fn test_command_wraps_whole_script() {
        let executor = ScriptExecutor::new("/bin/sh");
        let command = executor.command("cd /tmp\necho 'x'");
        assert_eq!(command[0], "/bin/sh");
        assert_eq!(command[1], "-c");
        assert_eq!(command[2], "/bin/sh -c 'cd /tmp\necho '\\''x'\\'''");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_exec().times(1).returning(|_, _| {
            Ok(ExecOutput {
                output: Vec::new(),
                exit_code: Some(42),
            })
        });

        let result = ScriptExecutor::new("/bin/sh")
            .execute(&runtime, &container(), "exit 42", None, Instant::now())
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn test_output_is_decoded_lossily() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_exec().returning(|_, request| {
            assert_eq!(request.stdin.as_deref(), Some("input"));
            Ok(ExecOutput {
                output: vec![b'o', b'k', 0xff, b'\n'],
                exit_code: Some(0),
            })
        });

        let result = ScriptExecutor::new("/bin/sh")
            .execute(&runtime, &container(), "cat", Some("input"), Instant::now())
            .await;

        assert!(result.success);
        assert_eq!(result.stdout, "ok\u{fffd}\n");
    }

    #[tokio::test]
    async fn test_exec_failure_is_protocol_error() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_exec().returning(|_, _| {
            Err(RuntimeError::ContainerNotFound("abc123".into()))
        });

        let result = ScriptExecutor::new("/bin/sh")
            .execute(&runtime, &container(), "echo hi", None, Instant::now())
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("abc123"));
    }
}
