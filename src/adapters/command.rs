use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;
use tokio::process::{ChildStdin, Command};

use super::{AdapterError, GenerationContext, GenerationMode, Generator, non_empty};
use crate::config::CommandConfig;

/// Runs an external program per generation.
///
/// The input text is written to stdin and the program's stdout is the
/// output. The mode and every context entry are passed as
/// `CHAPTERFLOW_MODE` / `CHAPTERFLOW_CTX_<KEY>` environment variables. A
/// non-zero exit status of 75 (`EX_TEMPFAIL`) is treated as transient; any
/// other failure is fatal.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

const EX_TEMPFAIL: i32 = 75;

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CommandConfig) -> anyhow::Result<Self> {
        let Some(program) = config.program.as_deref() else {
            anyhow::bail!("missing command.program (required when engine is `command`)");
        };
        Ok(Self::new(program, config.args.clone()))
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> Result<String, AdapterError> {
        tracing::debug!(%mode, command = %self.program, "command generate");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("CHAPTERFLOW_MODE", mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in context.iter() {
            cmd.env(format!("CHAPTERFLOW_CTX_{}", key.to_ascii_uppercase()), value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AdapterError::Fatal(format!("spawn generator command {}: {err}", self.program))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Fatal("open generator stdin".to_owned()))?;

        // Feed stdin while stdout drains, or a filter blocks on a full pipe.
        let (written, output) = tokio::join!(write_input(stdin, input), child.wait_with_output());
        let output = output
            .map_err(|err| AdapterError::Transient(format!("wait generator command: {err}")))?;
        written?;

        if !output.status.success() {
            let message = format!(
                "generator command failed: {} ({})",
                self.program, output.status
            );
            return Err(if output.status.code() == Some(EX_TEMPFAIL) {
                AdapterError::Transient(message)
            } else {
                AdapterError::Fatal(message)
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| {
            AdapterError::BadOutput("generator stdout is not valid UTF-8".to_owned())
        })?;
        non_empty(stdout.trim_end().to_owned())
    }
}

/// Writes the whole input, then closes the pipe so the child sees EOF.
async fn write_input(mut stdin: ChildStdin, input: &str) -> Result<(), AdapterError> {
    match stdin.write_all(input.as_bytes()).await {
        // A program that exits without reading stdin closes the pipe early.
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(AdapterError::Transient(format!("write generator stdin: {err}"))),
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandGenerator {
        CommandGenerator::new("sh", vec!["-c".to_owned(), script.to_owned()])
    }

    #[tokio::test]
    async fn passes_mode_and_context_through_env() -> anyhow::Result<()> {
        let generator = sh(r#"printf '%s|%s|' "$CHAPTERFLOW_MODE" "$CHAPTERFLOW_CTX_TITLE"; cat"#);
        let ctx = GenerationContext::new().with(GenerationContext::TITLE, "Gates");
        let out = generator
            .generate(GenerationMode::Spin, "body\n", &ctx)
            .await?;
        assert_eq!(out, "spin|Gates|body");
        Ok(())
    }

    #[tokio::test]
    async fn exit_status_is_classified() {
        let transient = sh("cat >/dev/null; exit 75")
            .generate(GenerationMode::Draft, "x", &GenerationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(transient, AdapterError::Transient(_)));

        let fatal = sh("exit 2")
            .generate(GenerationMode::Draft, "x", &GenerationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(fatal, AdapterError::Fatal(_)));

        let empty = sh("cat >/dev/null")
            .generate(GenerationMode::Draft, "x", &GenerationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(empty, AdapterError::BadOutput(_)));
    }

    #[tokio::test]
    async fn input_larger_than_a_pipe_buffer_round_trips() -> anyhow::Result<()> {
        let line = "The keeper logged the tide in his ledger once more.\n";
        let input = line.repeat(1_500_000 / line.len());
        let generator = CommandGenerator::new("cat", Vec::new());
        let out = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            generator.generate(GenerationMode::Spin, &input, &GenerationContext::new()),
        )
        .await??;
        assert_eq!(out.len(), input.trim_end().len());
        assert!(out.starts_with(line.trim_end()));
        Ok(())
    }
}
