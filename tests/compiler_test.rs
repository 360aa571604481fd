use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use shire::{
    command::{CommandContext, CommandExecutionError, CommandHandler, CommandInvocation, MockShellSafetyChecker, SafetyVerdict},
    compiler::{CompileState, Compiler, Environment, ERROR_MARKER},
    config::CompilerConfig,
    source::FileSystemContext,
    variable::VariableScope,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/lib.rs"),
        "// header\npub fn one() {}\npub fn two() {}\n// TODO tidy\n",
    )
    .unwrap();
    dir
}

async fn compile(env: Environment, root: &std::path::Path, source: &str) -> shire::CompiledResult {
    Compiler::new(Arc::new(env))
        .compile(source, &FileSystemContext::new(root), HashMap::new())
        .await
}

#[tokio::test]
async fn test_variable_from_matching_file() {
    let dir = project();
    let source = "---\nvariables:\n  \"content\": /a\\.txt/ { cat }\n---\nSay $content";
    let result = compile(Environment::default(), dir.path(), source).await;
    assert!(!result.has_error, "{:?}", result.error_message);
    assert_eq!(result.output, "Say hi");
    assert!(result.is_local_command);
    assert_eq!(result.state, CompileState::Done);

    let history = result.variables.history("content");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].function_name, "cat");
    assert_eq!(
        result.variables.get("content").map(|v| v.scope),
        Some(VariableScope::UserDefined)
    );
}

#[tokio::test]
async fn test_pipeline_with_references() {
    let dir = project();
    let source = r#"---
variables:
  "fns": /src\/lib\.rs/ { cat | grep("^pub fn .*") }
  "first": { print($fns) | head(1) }
---
$first"#;
    let result = compile(Environment::default(), dir.path(), source).await;
    assert_eq!(result.output, "pub fn one() {}");
    assert_eq!(result.variables.iter().map(|(name, _)| name).collect::<Vec<_>>(), vec!["fns", "first"]);
}

#[tokio::test]
async fn test_required_variable_fails_run() {
    let dir = project();
    let source = "---\nvariables:\n  \"logs\"!: /nothing\\.log/ { cat }\n---\nbody";
    let result = compile(Environment::default(), dir.path(), source).await;
    assert!(result.has_error);
    assert_eq!(result.state, CompileState::Error);
    assert!(result.error_message.unwrap().contains("logs"));
}

#[tokio::test]
async fn test_optional_variable_degrades_to_empty() {
    let dir = project();
    let source = "---\nvariables:\n  \"logs\": /nothing\\.log/ { cat }\n  \"greeting\": \"hello\"\n---\n[$logs] $greeting";
    let result = compile(Environment::default(), dir.path(), source).await;
    assert!(!result.has_error);
    assert_eq!(result.output, "[] hello");
    assert_eq!(result.warnings.len(), 1);
}

#[tokio::test]
async fn test_file_command_with_line_range() {
    let dir = project();
    let result = compile(Environment::default(), dir.path(), "/file:src/lib.rs#L2-L3").await;
    assert_eq!(result.output, "```rust\npub fn one() {}\npub fn two() {}\n```");
}

#[tokio::test]
async fn test_write_is_blocked_by_checker() {
    let dir = project();
    let mut checker = MockShellSafetyChecker::new();
    checker
        .expect_check_dangerous_command()
        .returning(|_| SafetyVerdict::dangerous("writes are disabled"));
    let env = Environment::default().with_safety_checker(Arc::new(checker));

    let source = "/write:out.txt\n```\ncontent\n```\n";
    let result = compile(env, dir.path(), source).await;
    assert!(result.output.starts_with(ERROR_MARKER));
    assert!(result.output.contains("writes are disabled"));
    assert!(!dir.path().join("out.txt").exists());
}

#[tokio::test]
async fn test_write_outside_root_is_rejected() {
    let dir = project();
    let result = compile(Environment::default(), dir.path(), "/write:../escape.txt\n```\nx\n```").await;
    assert!(result.output.starts_with(ERROR_MARKER));
    assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn test_shell_timeout_is_reported_inline() {
    let dir = project();
    let env = Environment::default().with_config(CompilerConfig {
        command_timeout: std::time::Duration::from_millis(100),
        ..Default::default()
    });
    let result = compile(env, dir.path(), "before /shell:\"sleep 5\" after").await;
    assert!(!result.has_error);
    assert!(result.output.contains("timed out after 100ms"));
    assert!(result.output.ends_with(" after"));
}

struct SlowCommand;

#[async_trait]
impl CommandHandler for SlowCommand {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(
        &self,
        _invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(CommandExecutionError::Cancelled(self.name().to_string())),
            _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => Ok("late".to_string()),
        }
    }
}

#[tokio::test]
async fn test_cancellation_during_command() {
    let dir = project();
    let compiler = Compiler::new(Arc::new(Environment::default().with_command(Arc::new(SlowCommand))));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = compiler
        .compile_with_cancellation("a /slow b", &FileSystemContext::new(dir.path()), HashMap::new(), cancel)
        .await;
    assert!(result.is_cancelled());
    assert_eq!(result.state, CompileState::Error);
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let dir = project();
    let compiler = Arc::new(Compiler::default());
    let mut handles = Vec::new();
    for i in 0..8 {
        let compiler = compiler.clone();
        let root = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let mut overrides = HashMap::new();
            overrides.insert("n".to_string(), serde_json::json!(i));
            compiler
                .compile("run $n", &FileSystemContext::new(root), overrides)
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.output, format!("run {}", i));
    }
}

#[tokio::test]
async fn test_syntax_errors_are_kept_inline() {
    let dir = project();
    let result = compile(Environment::default(), dir.path(), "intro\n```rust\nfn main() {}").await;
    assert!(!result.has_error);
    assert_eq!(result.errors.len(), 1);
    assert!(result.output.contains("unterminated code fence"));
}

#[tokio::test]
async fn test_quoted_mentions_stay_local() {
    let dir = project();
    let source = "Reply with \"thanks @team\" please.\n[note]: keep this line\nThen ask @reviewer";
    let result = compile(Environment::default(), dir.path(), source).await;
    let invocation = result.agent_invocation.expect("agent outside quotes dispatches");
    assert_eq!(invocation.name, "reviewer");
    assert_eq!(
        invocation.context,
        "Reply with \"thanks @team\" please.\n[note]: keep this line\nThen ask "
    );
}

proptest! {
    #[test]
    fn test_sigil_free_text_compiles_to_itself(source in "[ -#%-.0-?A-_a-~\n]{0,160}") {
        prop_assume!(!source.trim_start().starts_with("---"));
        prop_assume!(!source.contains("[flow]:"));
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result = runtime.block_on(compile(Environment::default(), dir.path(), &source));
        prop_assert!(!result.has_error);
        prop_assert_eq!(result.output, source);
    }
}
