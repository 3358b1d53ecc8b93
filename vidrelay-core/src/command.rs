use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Seam for every external tool the pipeline spawns (`yt-dlp`, `ffmpeg`,
/// the uploader).
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

/// Spawns the child with piped output and drains stdout and stderr on two
/// tasks while it runs, logging each line.
#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn()?;

        let stdout = child.stdout.take().map(|pipe| drain(pipe, program.clone(), "stdout"));
        let stderr = child.stderr.take().map(|pipe| drain(pipe, program.clone(), "stderr"));

        let status = child.wait().await?;
        let stdout = join_drain(stdout).await;
        let stderr = join_drain(stderr).await;

        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

fn drain<R>(
    pipe: R,
    program: String,
    stream: &'static str,
) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        // Drain to EOF regardless of encoding.
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    debug!(target: "command", program = %program, stream, "{}", text.trim_end());
                    collected.extend_from_slice(&line);
                }
                Err(err) => {
                    warn!(target: "command", program = %program, stream, error = %err, "output read failed");
                    break;
                }
            }
        }
        collected
    })
}

async fn join_drain(handle: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("{program} exited with {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Runs `command` under a lifetime limit. The child is killed when the limit
/// elapses, and a non-zero exit becomes [`CommandError::Failed`].
pub async fn run_with_timeout(
    executor: &dyn CommandExecutor,
    command: &mut Command,
    limit: Duration,
) -> Result<Output, CommandError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    command.kill_on_drop(true);
    let output = match tokio::time::timeout(limit, executor.run(command)).await {
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?,
        Err(_) => {
            return Err(CommandError::Timeout {
                program,
                seconds: limit.as_secs(),
            })
        }
    };
    if !output.status.success() {
        return Err(CommandError::Failed {
            program,
            status: output.status.code(),
            stderr: tail(&String::from_utf8_lossy(&output.stderr), 20),
        });
    }
    Ok(output)
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

/// Argument list of a prepared command, for logging and test assertions.
pub fn command_args(command: &Command) -> Vec<String> {
    command
        .as_std()
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::{Arc, Mutex};

    use super::*;

    pub type Invocation = (String, Vec<String>);
    pub type Hook = Box<dyn Fn(&[String]) + Send + Sync>;

    /// Replays scripted outputs in order and records every invocation.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        pub calls: Arc<Mutex<Vec<Invocation>>>,
        responses: Mutex<VecDeque<(i32, String, String)>>,
        hook: Option<Hook>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, code: i32, stdout: &str, stderr: &str) -> Self {
            self.responses
                .lock()
                .unwrap()
                .push_back((code, stdout.to_string(), stderr.to_string()));
            self
        }

        pub fn with_hook(mut self, hook: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
            self.hook = Some(Box::new(hook));
            self
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let program = command
                .as_std()
                .get_program()
                .to_string_lossy()
                .into_owned();
            let args = command_args(command);
            if let Some(hook) = &self.hook {
                hook(&args);
            }
            self.calls.lock().unwrap().push((program, args));
            let (code, stdout, stderr) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((0, String::new(), String::new()));
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
            })
        }
    }
}
