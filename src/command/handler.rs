use std::{collections::BTreeMap, collections::HashMap, fmt, process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::CommandExecutionError;
use crate::config::CompilerConfig;
use crate::language::LanguageTable;
use crate::source::{FileSystemContext, SourceResolver};

/// Code block handed to a command that consumes the block after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeInput {
    pub language_id: Option<String>,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub name: String,
    pub properties: BTreeMap<String, String>,
    pub argument: Option<String>,
    pub code: Option<CodeInput>,
}

impl CommandInvocation {
    pub fn new(name: impl Into<String>, argument: Option<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
            argument,
            code: None,
        }
    }

    fn line_property(&self, key: &str) -> Option<usize> {
        self.properties.get(key).and_then(|v| v.parse().ok())
    }

    fn require_argument(&self) -> Result<&str, CommandExecutionError> {
        self.argument
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| CommandExecutionError::MissingArgument {
                command: self.name.clone(),
            })
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name)?;
        if let Some(argument) = &self.argument {
            write!(f, ":{}", argument)?;
        }
        Ok(())
    }
}

/// What a command may touch while it runs.
#[derive(Clone)]
pub struct CommandContext {
    pub fs: FileSystemContext,
    pub source: Arc<dyn SourceResolver>,
    pub languages: Arc<LanguageTable>,
    pub config: Arc<CompilerConfig>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Destructive commands are screened by the safety checker first.
    fn is_destructive(&self) -> bool {
        false
    }

    /// Whether the code block right after the command is its input.
    fn consumes_code_block(&self) -> bool {
        false
    }

    /// Text handed to the safety checker.
    fn command_text(&self, invocation: &CommandInvocation) -> String {
        invocation.to_string()
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError>;
}

#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileCommand));
        registry.register(Arc::new(DirCommand));
        registry.register(Arc::new(PrintCommand));
        registry.register(Arc::new(ShellCommand));
        registry.register(Arc::new(WriteCommand));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// `/file:path[#L1-L5]`: file contents in a fenced block.
pub struct FileCommand;

#[async_trait]
impl CommandHandler for FileCommand {
    fn name(&self) -> &str {
        "file"
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        let path = invocation.require_argument()?;
        let content = ctx.source.read(&ctx.fs, path).await?;
        let lines: Vec<&str> = content.lines().collect();

        let selected = match invocation.line_property("startLine") {
            Some(start) => {
                let end = invocation.line_property("endLine").unwrap_or(start);
                if start == 0 || start > end || start > lines.len() {
                    return Err(CommandExecutionError::InvalidRange {
                        path: path.to_string(),
                        start,
                        end,
                    });
                }
                lines[start - 1..end.min(lines.len())].join("\n")
            }
            None => content.trim_end_matches('\n').to_string(),
        };

        let language = ctx
            .languages
            .for_path(path)
            .map(|t| t.language_id)
            .unwrap_or_default();
        Ok(format!("```{}\n{}\n```", language, selected))
    }
}

/// `/dir:path`: one entry per line.
pub struct DirCommand;

#[async_trait]
impl CommandHandler for DirCommand {
    fn name(&self) -> &str {
        "dir"
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        let path = invocation.argument.as_deref().unwrap_or(".");
        Ok(ctx.source.list_dir(&ctx.fs, path).await?.join("\n"))
    }
}

pub struct PrintCommand;

#[async_trait]
impl CommandHandler for PrintCommand {
    fn name(&self) -> &str {
        "print"
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        _ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        Ok(invocation.argument.clone().unwrap_or_default())
    }
}

/// `/shell:"cmd"` or `/shell` followed by a code block.
pub struct ShellCommand;

impl ShellCommand {
    fn script(invocation: &CommandInvocation) -> Option<String> {
        invocation
            .code
            .as_ref()
            .map(|c| c.code.clone())
            .or_else(|| invocation.argument.clone())
            .filter(|s| !s.trim().is_empty())
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[async_trait]
impl CommandHandler for ShellCommand {
    fn name(&self) -> &str {
        "shell"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn consumes_code_block(&self) -> bool {
        true
    }

    fn command_text(&self, invocation: &CommandInvocation) -> String {
        Self::script(invocation).unwrap_or_default()
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        let script = Self::script(invocation).ok_or_else(|| CommandExecutionError::MissingArgument {
            command: self.name().to_string(),
        })?;
        let failed = |message: String| CommandExecutionError::Failed {
            command: script.clone(),
            message,
        };

        info!("running shell command in {}", ctx.fs.root.display());
        let child = tokio::process::Command::new(&ctx.config.shell)
            .arg("-c")
            .arg(&script)
            .current_dir(&ctx.fs.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let timeout = ctx.config.command_timeout;
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(CommandExecutionError::Cancelled(self.name().to_string()));
            }
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Err(_) => {
                    return Err(CommandExecutionError::Timeout {
                        command: script.clone(),
                        millis: timeout.as_millis(),
                    })
                }
                Ok(Err(e)) => return Err(failed(e.to_string())),
                Ok(Ok(output)) => output,
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            };
            return Err(failed(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!("shell command produced {} bytes", stdout.len());
        Ok(truncate(stdout, ctx.config.max_command_output))
    }
}

/// `/write:path` followed by a code block: writes the block inside the root.
pub struct WriteCommand;

#[async_trait]
impl CommandHandler for WriteCommand {
    fn name(&self) -> &str {
        "write"
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn consumes_code_block(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        let path = invocation.require_argument()?;
        let code = invocation
            .code
            .as_ref()
            .ok_or_else(|| CommandExecutionError::MissingCodeBlock {
                command: self.name().to_string(),
            })?;
        let target = ctx.fs.resolve(path)?;
        let io_failed = |e: std::io::Error| CommandExecutionError::Failed {
            command: invocation.to_string(),
            message: e.to_string(),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_failed)?;
        }
        tokio::fs::write(&target, code.code.as_bytes())
            .await
            .map_err(io_failed)?;
        info!("wrote {} bytes to {}", code.code.len(), target.display());
        Ok(format!("Wrote {} bytes to {}", code.code.len(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileSystemSourceResolver;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn context(root: &std::path::Path, config: CompilerConfig) -> CommandContext {
        CommandContext {
            fs: FileSystemContext::new(root),
            source: Arc::new(FileSystemSourceResolver::new()),
            languages: Arc::new(LanguageTable::builtin()),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_file_command_with_line_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "l1\nl2\nl3\nl4\n").unwrap();
        let ctx = context(dir.path(), CompilerConfig::default());

        let mut invocation = CommandInvocation::new("file", Some("a.rs".to_string()));
        invocation.properties.insert("startLine".to_string(), "2".to_string());
        invocation.properties.insert("endLine".to_string(), "3".to_string());
        assert_eq!(
            FileCommand.execute(&invocation, &ctx).await.unwrap(),
            "```rust\nl2\nl3\n```"
        );

        invocation.properties.insert("startLine".to_string(), "9".to_string());
        invocation.properties.insert("endLine".to_string(), "9".to_string());
        assert!(matches!(
            FileCommand.execute(&invocation, &ctx).await,
            Err(CommandExecutionError::InvalidRange { .. })
        ));

        let missing = CommandInvocation::new("file", None);
        assert!(matches!(
            FileCommand.execute(&missing, &ctx).await,
            Err(CommandExecutionError::MissingArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_shell_command_output_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), CompilerConfig::default());

        let echo = CommandInvocation::new("shell", Some("echo hello".to_string()));
        assert_eq!(ShellCommand.execute(&echo, &ctx).await.unwrap(), "hello");

        let failing = CommandInvocation::new("shell", Some("echo oops >&2; exit 3".to_string()));
        match ShellCommand.execute(&failing, &ctx).await {
            Err(CommandExecutionError::Failed { message, .. }) => assert_eq!(message, "oops"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = CompilerConfig {
            command_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let ctx = context(dir.path(), config);
        let mut sleep = CommandInvocation::new("shell", None);
        sleep.code = Some(CodeInput {
            language_id: Some("bash".to_string()),
            code: "sleep 5".to_string(),
        });
        assert!(matches!(
            ShellCommand.execute(&sleep, &ctx).await,
            Err(CommandExecutionError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_command_stays_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), CompilerConfig::default());
        let mut write = CommandInvocation::new("write", Some("out/hello.txt".to_string()));
        write.code = Some(CodeInput {
            language_id: None,
            code: "hi".to_string(),
        });
        WriteCommand.execute(&write, &ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out/hello.txt")).unwrap(), "hi");

        write.argument = Some("../escape.txt".to_string());
        assert!(matches!(
            WriteCommand.execute(&write, &ctx).await,
            Err(CommandExecutionError::Source(_))
        ));
    }

    #[test]
    fn test_registry() {
        let registry = CommandRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["dir", "file", "print", "shell", "write"]);
        assert!(registry.get("shell").map(|h| h.is_destructive()).unwrap_or(false));
        assert!(!registry.get("file").map(|h| h.is_destructive()).unwrap_or(true));
    }
}
