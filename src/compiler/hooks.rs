//! Hooks that run pipelines outside variable resolution: nested `execute`
//! calls and the `afterStreaming` hook.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Compiler, DocumentRef, Environment, RunContext};
use crate::ast::{value_text, HookKind};
use crate::compiler::CompiledResult;
use crate::source::FileSystemContext;
use crate::variable::{
    BuiltinFunction, NamedReference, ResolverContext, ScriptExecutor, Value, VariableEngine,
    VariableResolutionError, VariableScope,
};

/// `execute` hops the compiler follows by itself. Longer chains belong to
/// the caller.
pub const MAX_EXECUTE_DEPTH: usize = 1;

/// Name under which `afterStreaming` sees the streamed text.
const OUTPUT_VARIABLE: &str = "output";

/// Compiles `execute` targets with the environment of the calling compiler.
pub struct ScriptRunner {
    env: Arc<Environment>,
    depth: usize,
    cancel: CancellationToken,
}

impl ScriptRunner {
    pub fn new(env: Arc<Environment>, depth: usize, cancel: CancellationToken) -> Self {
        Self { env, depth, cancel }
    }
}

#[async_trait]
impl ScriptExecutor for ScriptRunner {
    async fn execute(
        &self,
        path: &str,
        variables: Vec<NamedReference>,
        ctx: &ResolverContext,
    ) -> Result<String, VariableResolutionError> {
        if self.depth >= MAX_EXECUTE_DEPTH {
            return Err(VariableResolutionError::ScriptFailed {
                path: path.to_string(),
                message: format!("only {} nested `execute` hop is followed", MAX_EXECUTE_DEPTH),
            });
        }
        let source = ctx.source.read(&ctx.fs, path).await?;
        let fs = FileSystemContext::new(ctx.fs.root.clone()).with_current_file(ctx.fs.resolve(path)?);
        let overrides: HashMap<String, serde_json::Value> = variables
            .into_iter()
            .map(|reference| (reference.name, serde_json::Value::String(reference.value)))
            .collect();

        info!("executing `{}` at depth {}", path, self.depth + 1);
        let nested = Compiler {
            env: self.env.clone(),
            depth: self.depth + 1,
        };
        let result = nested
            .compile_with_cancellation(&source, &fs, overrides, self.cancel.clone())
            .await;
        if result.is_cancelled() {
            return Err(VariableResolutionError::Cancelled);
        }
        if result.has_error {
            return Err(VariableResolutionError::ScriptFailed {
                path: path.to_string(),
                message: result.error_message.unwrap_or_default(),
            });
        }
        Ok(result.output)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AfterStreamingOutcome {
    /// Value left by the last step, or the streamed text when nothing ran.
    pub output: String,
    /// Scripts compiled by `execute` steps, in order.
    pub executed: Vec<DocumentRef>,
    /// Messages of `notify` steps.
    pub notifications: Vec<String>,
    pub warnings: Vec<String>,
}

impl Compiler {
    /// Runs the `afterStreaming` pipeline of `compiled` with the streamed
    /// text as input and as `$output`.
    ///
    /// Failures are reported as warnings and leave `output` unchanged.
    pub async fn after_streaming(
        &self,
        compiled: &CompiledResult,
        output: &str,
        fs: &FileSystemContext,
        cancel: CancellationToken,
    ) -> AfterStreamingOutcome {
        let mut outcome = AfterStreamingOutcome {
            output: output.to_string(),
            ..Default::default()
        };
        let pipeline = match compiled
            .resolved_config
            .as_ref()
            .and_then(|fm| fm.hook(HookKind::AfterStreaming))
        {
            Some(pipeline) if compiled.condition_met && !compiled.has_error => pipeline,
            _ => return outcome,
        };

        let run = RunContext::new(fs.clone(), cancel);
        let mut table = compiled.variables.clone();
        if !table.insert(OUTPUT_VARIABLE, Value::text(output), VariableScope::System) {
            warn!("`{}` is already bound, `afterStreaming` keeps its value", OUTPUT_VARIABLE);
            outcome
                .warnings
                .push(format!("`{}` is already bound", OUTPUT_VARIABLE));
        }

        let engine = VariableEngine::new(&self.env.resolvers, self.resolver_context(&run), run.cancel.clone());
        let hook = HookKind::AfterStreaming.to_string();
        match engine
            .run_pipeline(&hook, pipeline, Value::text(output), &[], &mut table)
            .await
        {
            Ok((value, steps)) => {
                for step in &steps {
                    if step.function == BuiltinFunction::Execute.as_ref() {
                        let path = step.args.first().map(argument_text).unwrap_or_default();
                        outcome.executed.push(DocumentRef { path });
                    } else if step.function == BuiltinFunction::Notify.as_ref() {
                        let message = step.args.iter().map(argument_text).collect::<Vec<_>>().join(" ");
                        outcome.notifications.push(if message.is_empty() {
                            step.value.to_string()
                        } else {
                            message
                        });
                    }
                }
                outcome.output = value.to_string();
            }
            Err(failure) => {
                warn!("`afterStreaming` failed: {}", failure.error);
                outcome.warnings.push(failure.error.to_string());
            }
        }
        outcome
    }
}

fn argument_text(arg: &serde_json::Value) -> String {
    NamedReference::from_json(arg)
        .map(|reference| reference.value)
        .unwrap_or_else(|| value_text(arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn compiled(dir: &std::path::Path, source: &str) -> (Compiler, CompiledResult) {
        let compiler = Compiler::new(Arc::new(Environment::default()));
        let result = compiler
            .compile(source, &FileSystemContext::new(dir), HashMap::new())
            .await;
        (compiler, result)
    }

    #[tokio::test]
    async fn test_after_streaming_runs_whole_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("next.shire"), "next got: $output").unwrap();
        let source = "---\nafterStreaming: { trim | notify(\"streamed\") | execute(\"next.shire\", $output) }\n---\nbody";
        let (compiler, result) = compiled(dir.path(), source).await;
        let fs = FileSystemContext::new(dir.path());

        let outcome = compiler
            .after_streaming(&result, "  answer  ", &fs, CancellationToken::new())
            .await;
        assert_eq!(outcome.output, "next got:   answer  ");
        assert_eq!(
            outcome.executed,
            vec![DocumentRef {
                path: "next.shire".to_string()
            }]
        );
        assert_eq!(outcome.notifications, vec!["streamed"]);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_case_match_on_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("next.shire"), "recovered").unwrap();
        let source = "---\nafterStreaming: { case \"$output\" { \"error\" { notify(\"failed\") } default { execute(\"next.shire\") } } }\n---\nbody";
        let (compiler, result) = compiled(dir.path(), source).await;
        let fs = FileSystemContext::new(dir.path());

        let failed = compiler
            .after_streaming(&result, "error", &fs, CancellationToken::new())
            .await;
        assert_eq!(failed.notifications, vec!["failed"]);
        assert!(failed.executed.is_empty());
        assert_eq!(failed.output, "error");

        let fine = compiler
            .after_streaming(&result, "all good", &fs, CancellationToken::new())
            .await;
        assert!(fine.notifications.is_empty());
        assert_eq!(fine.executed.len(), 1);
        assert_eq!(fine.output, "recovered");
    }

    #[tokio::test]
    async fn test_after_streaming_failure_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (compiler, result) = compiled(dir.path(), "---\nafterStreaming: \"missing.shire\"\n---\nbody").await;
        let outcome = compiler
            .after_streaming(&result, "text", &FileSystemContext::new(dir.path()), CancellationToken::new())
            .await;
        assert_eq!(outcome.output, "text");
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.executed.is_empty());

        let (compiler, result) = compiled(dir.path(), "no hooks").await;
        let outcome = compiler
            .after_streaming(&result, "text", &FileSystemContext::new(dir.path()), CancellationToken::new())
            .await;
        assert_eq!(outcome, AfterStreamingOutcome {
            output: "text".to_string(),
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_runner_stops_after_one_hop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.shire"), "a").unwrap();
        let env = Arc::new(Environment::default());
        let ctx = ResolverContext {
            fs: FileSystemContext::new(dir.path()),
            source: env.source.clone(),
            executor: None,
        };

        let top = ScriptRunner::new(env.clone(), 0, CancellationToken::new());
        assert_eq!(top.execute("a.shire", vec![], &ctx).await, Ok("a".to_string()));

        let nested = ScriptRunner::new(env, MAX_EXECUTE_DEPTH, CancellationToken::new());
        assert!(matches!(
            nested.execute("a.shire", vec![], &ctx).await,
            Err(VariableResolutionError::ScriptFailed { .. })
        ));
    }
}
