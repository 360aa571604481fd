//! # Compiler
//!
//! Runs a parsed [`Document`] through a small state machine:
//!
//! ```text
//! PARSED → VARIABLES_RESOLVED → BODY_EXECUTED → LOCAL_RESULT | AGENT_DISPATCH → DONE
//!    └──────────────┴──────────────────┴──────────── ERROR
//! ```
//!
//! Local failures (unknown commands, blocked commands, unresolved
//! references) are written into the output as `<ShireError>: ...` markers.
//! Only malformed front-matter, failing required variables and cancellation
//! end the run in `ERROR`.

pub mod environment;
pub mod hooks;
pub mod result;

use std::{collections::HashMap, path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer;
use crate::ast::{BodyNode, Document, FrontMatterBlock, HookKind, SourcePattern, VariableDeclaration};
use crate::command::{CodeInput, CommandContext, CommandExecutionError, CommandInvocation};
use crate::source::FileSystemContext;
use crate::variable::{
    condition, ResolverContext, Value, VariableEngine, VariableResolutionError, VariableScope, VariableTable,
};

pub use environment::Environment;
pub use hooks::{AfterStreamingOutcome, ScriptRunner, MAX_EXECUTE_DEPTH};
pub use result::{
    error_marker, AgentDispatchError, AgentInvocationRequest, CompileState, CompiledResult, DocumentRef,
    ERROR_MARKER,
};

const CANCELLED_MESSAGE: &str = "compilation cancelled";

/// Per-run data shared by every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub fs: FileSystemContext,
    pub cancel: CancellationToken,
    pub run_id: Uuid,
}

impl RunContext {
    pub fn new(fs: FileSystemContext, cancel: CancellationToken) -> Self {
        Self {
            fs,
            cancel,
            run_id: Uuid::new_v4(),
        }
    }
}

pub struct Compiler {
    env: Arc<Environment>,
    /// Number of `execute` hops above this compiler.
    depth: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Environment::shared())
    }
}

impl Compiler {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env, depth: 0 }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub async fn compile(
        &self,
        source: &str,
        fs: &FileSystemContext,
        overrides: HashMap<String, serde_json::Value>,
    ) -> CompiledResult {
        self.compile_with_cancellation(source, fs, overrides, CancellationToken::new())
            .await
    }

    pub async fn compile_with_cancellation(
        &self,
        source: &str,
        fs: &FileSystemContext,
        overrides: HashMap<String, serde_json::Value>,
        cancel: CancellationToken,
    ) -> CompiledResult {
        let run = RunContext::new(fs.clone(), cancel);
        info!("compiling run {}", run.run_id);

        let document = match analyzer::parse_source(source) {
            Ok(document) => document,
            Err(err) => return CompiledResult::new(source).fail(err.to_string()),
        };
        let table = self.initial_table(&run.fs, overrides);
        self.compile_document(source, &document, table, &run).await
    }

    /// Overrides first, then environment values, then file metadata; the
    /// first insert of a name wins.
    fn initial_table(&self, fs: &FileSystemContext, overrides: HashMap<String, serde_json::Value>) -> VariableTable {
        let mut table = VariableTable::new();
        let mut overrides: Vec<_> = overrides.into_iter().collect();
        overrides.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in overrides {
            table.insert(&name, Value::from_json(&value), VariableScope::System);
        }

        let mut system: Vec<_> = self.env.system_variables.iter().collect();
        system.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in system {
            table.insert(name, value.clone(), VariableScope::System);
        }

        if let Some(file) = &fs.current_file {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            table.insert("fileName", Value::String(name), VariableScope::System);
            table.insert("filePath", Value::String(fs.relative(file)), VariableScope::System);
        }
        table
    }

    /// Runs the state machine on an already parsed document.
    pub async fn compile_document(
        &self,
        input: &str,
        document: &Document,
        table: VariableTable,
        run: &RunContext,
    ) -> CompiledResult {
        let mut result = CompiledResult::new(input);
        result.errors = document.errors.clone();
        result.resolved_config = document.front_matter.clone();
        result.variables = table;
        result.is_local_command = !document.has_agent_mention()
            && !document
                .front_matter
                .as_ref()
                .is_some_and(FrontMatterBlock::requires_streaming);

        if let Some(front_matter) = &document.front_matter {
            match self.resolve_variables(front_matter, &mut result.variables, run).await {
                Ok(warnings) => result.warnings.extend(warnings),
                Err(VariableResolutionError::Cancelled) => return result.fail(CANCELLED_MESSAGE),
                Err(err) => return result.fail(err.to_string()),
            }
            result.next_job = hook_next_job(front_matter);
            if let Some(when) = front_matter.when.as_deref().filter(|w| !w.trim().is_empty()) {
                result.condition_met = match condition::evaluate(when, &result.variables) {
                    Ok(met) => met,
                    Err(err) => {
                        warn!("`when` condition failed: {}", err);
                        result.warnings.push(format!("`when` condition failed: {}", err));
                        false
                    }
                };
            }
        }
        result.transition(CompileState::VariablesResolved);

        if result.condition_met {
            if let Err(message) = self.execute_body(document, &mut result, run).await {
                return result.fail(message);
            }
        } else {
            info!("run {} skips its body, `when` is false", run.run_id);
            result.warnings.push("`when` condition is false, body skipped".to_string());
            result.next_job = None;
        }
        result.transition(CompileState::BodyExecuted);

        if result.agent_invocation.is_some() {
            result.transition(CompileState::AgentDispatch);
        } else {
            result.transition(CompileState::LocalResult);
        }
        result.transition(CompileState::Done);
        debug!(
            "run {} produced {} bytes with {} warnings",
            run.run_id,
            result.output.len(),
            result.warnings.len()
        );
        result
    }

    async fn resolve_variables(
        &self,
        front_matter: &FrontMatterBlock,
        table: &mut VariableTable,
        run: &RunContext,
    ) -> Result<Vec<String>, VariableResolutionError> {
        let engine = VariableEngine::new(&self.env.resolvers, self.resolver_context(run), run.cancel.clone());

        let mut declarations = front_matter.variables.clone();
        if let Some(pipeline) = front_matter.hook(HookKind::BeforeStreaming) {
            declarations.push(VariableDeclaration {
                name: HookKind::BeforeStreaming.to_string(),
                source: SourcePattern::None,
                pipeline: pipeline.clone(),
                required: false,
            });
        }
        engine.resolve(&declarations, table).await
    }

    fn resolver_context(&self, run: &RunContext) -> ResolverContext {
        ResolverContext {
            fs: run.fs.clone(),
            source: self.env.source.clone(),
            executor: Some(Arc::new(ScriptRunner::new(self.env.clone(), self.depth, run.cancel.clone()))),
        }
    }

    fn command_context(&self, run: &RunContext) -> CommandContext {
        CommandContext {
            fs: run.fs.clone(),
            source: self.env.source.clone(),
            languages: self.env.languages.clone(),
            config: self.env.config.clone(),
            cancel: run.cancel.clone(),
        }
    }

    /// Walks the body in order. `Err` carries a message that ends the run.
    async fn execute_body(
        &self,
        document: &Document,
        result: &mut CompiledResult,
        run: &RunContext,
    ) -> Result<(), String> {
        let body = &document.body;
        let commands = self.command_context(run);
        let mut index = 0;

        while index < body.len() {
            if run.cancel.is_cancelled() {
                return Err(CANCELLED_MESSAGE.to_string());
            }
            let node = &body[index];
            index += 1;

            match node {
                BodyNode::Text { text } => result.output.push_str(text),
                BodyNode::CodeBlock { language_id, content } => {
                    if self.env.config.format_code_blocks {
                        let (language_id, content) = self.env.languages.format_code(language_id.as_deref(), content);
                        let formatted = BodyNode::CodeBlock { language_id, content };
                        result.output.push_str(&formatted.to_string());
                    } else {
                        result.output.push_str(&node.to_string());
                    }
                }
                BodyNode::VariableRef { name } => match result.variables.value(name) {
                    Some(value) => result.output.push_str(&value.to_string()),
                    None => {
                        warn!("unresolved variable `{}`", name);
                        result.warnings.push(format!("unresolved variable `{}`", name));
                    }
                },
                BodyNode::Comment { label, text } => {
                    if label == "flow" && result.next_job.is_none() && !text.is_empty() {
                        result.next_job = Some(DocumentRef { path: text.clone() });
                    }
                }
                BodyNode::Error { message, .. } => {
                    result.output.push_str(&error_marker(message));
                }
                BodyNode::Command {
                    name,
                    properties,
                    argument,
                } => {
                    let mut invocation = CommandInvocation {
                        name: name.clone(),
                        properties: properties.clone(),
                        argument: argument.clone(),
                        code: None,
                    };
                    let handler = self.env.commands.get(name);
                    if let Some(handler) = handler.as_ref().filter(|h| h.consumes_code_block()) {
                        if let Some((code, next)) = following_code_block(body, index) {
                            invocation.code = Some(code);
                            index = next;
                        }
                        debug!("`{}` consumes a code block: {}", handler.name(), invocation.code.is_some());
                    }
                    match self.run_command(handler, &invocation, &commands).await {
                        Ok(output) => result.output.push_str(&output),
                        Err(CommandExecutionError::Cancelled(_)) => return Err(CANCELLED_MESSAGE.to_string()),
                        Err(err) => {
                            warn!("command {} failed: {}", invocation, err);
                            result.warnings.push(err.to_string());
                            result.output.push_str(&error_marker(&err));
                        }
                    }
                }
                BodyNode::AgentMention { name } => {
                    if !self.is_known_agent(name, document) {
                        let err = AgentDispatchError::UnknownAgent(name.clone());
                        warn!("{}", err);
                        result.warnings.push(err.to_string());
                        result.output.push_str(&node.to_string());
                        if result.dispatch_error.is_none() {
                            result.dispatch_error = Some(err);
                        }
                        continue;
                    }
                    let deferred = body[index..].to_vec();
                    info!("dispatching to agent `{}` with {} deferred nodes", name, deferred.len());
                    result.agent_invocation = Some(AgentInvocationRequest {
                        name: name.clone(),
                        context: result.output.clone(),
                        prompt: deferred.iter().map(ToString::to_string).collect(),
                        deferred_nodes: deferred,
                    });
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_command(
        &self,
        handler: Option<Arc<dyn crate::command::CommandHandler>>,
        invocation: &CommandInvocation,
        ctx: &CommandContext,
    ) -> Result<String, CommandExecutionError> {
        let handler = handler.ok_or_else(|| CommandExecutionError::UnknownCommand(invocation.name.clone()))?;
        if handler.is_destructive() {
            let text = handler.command_text(invocation);
            let verdict = self.env.safety.check_dangerous_command(&text);
            if verdict.is_dangerous {
                return Err(CommandExecutionError::Blocked {
                    command: invocation.name.clone(),
                    reason: verdict.reason,
                });
            }
        }
        handler.execute(invocation, ctx).await
    }

    fn is_known_agent(&self, name: &str, document: &Document) -> bool {
        self.env.config.allow_undeclared_agents
            || self.env.agents.contains(name)
            || document
                .front_matter
                .as_ref()
                .is_some_and(|fm| fm.agents.iter().any(|a| a.name == name))
    }
}

/// The code block after `index`, skipping one whitespace-only text node.
fn following_code_block(body: &[BodyNode], index: usize) -> Option<(CodeInput, usize)> {
    let mut cursor = index;
    if let Some(BodyNode::Text { text }) = body.get(cursor) {
        if text.trim().is_empty() {
            cursor += 1;
        }
    }
    match body.get(cursor) {
        Some(node @ BodyNode::CodeBlock { language_id, .. }) => Some((
            CodeInput {
                language_id: language_id.clone(),
                code: node.code().unwrap_or_default().to_string(),
            },
            cursor + 1,
        )),
        _ => None,
    }
}

/// Target of an `execute("path")` call in the `afterStreaming` hook.
fn hook_next_job(front_matter: &FrontMatterBlock) -> Option<DocumentRef> {
    front_matter
        .hook(HookKind::AfterStreaming)?
        .iter()
        .find(|call| call.name == "execute")
        .and_then(|call| call.first_arg_text())
        .map(|path| DocumentRef { path })
}

/// Compiles a script file with the shared environment, rooted at its parent
/// directory unless `root` is given.
pub async fn compile_file(
    path: &Path,
    root: Option<&Path>,
    overrides: HashMap<String, serde_json::Value>,
) -> crate::ShireResult<CompiledResult> {
    let source = tokio::fs::read_to_string(path).await?;
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
    };
    let fs = FileSystemContext::new(root).with_current_file(path);
    Ok(Compiler::default().compile(&source, &fs, overrides).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{MockShellSafetyChecker, SafetyVerdict};
    use crate::config::CompilerConfig;
    use pretty_assertions::assert_eq;

    async fn compile_in(env: Environment, root: &Path, source: &str) -> CompiledResult {
        Compiler::new(Arc::new(env))
            .compile(source, &FileSystemContext::new(root), HashMap::new())
            .await
    }

    #[tokio::test]
    async fn test_plain_text_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let source = "Just words, a/b and me@x.com.\nSecond line";
        let result = compile_in(Environment::default(), dir.path(), source).await;
        assert_eq!(result.output, source);
        assert!(result.is_local_command);
        assert_eq!(result.state, CompileState::Done);
        assert_eq!(
            result.transitions,
            vec![
                CompileState::Parsed,
                CompileState::VariablesResolved,
                CompileState::BodyExecuted,
                CompileState::LocalResult,
                CompileState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_and_variable_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in(Environment::default(), dir.path(), "a /nope b $missing c").await;
        assert!(!result.has_error);
        assert_eq!(result.output, "a <ShireError>: unknown command `nope` b  c");
        assert_eq!(result.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut checker = MockShellSafetyChecker::new();
        checker
            .expect_check_dangerous_command()
            .withf(|cmd| cmd == "touch created.txt")
            .times(1)
            .returning(|_| SafetyVerdict::dangerous("creates files"));
        let env = Environment::default().with_safety_checker(Arc::new(checker));

        let result = compile_in(env, dir.path(), "/shell:\"touch created.txt\"").await;
        assert!(result.output.contains("creates files"));
        assert!(result.output.starts_with(ERROR_MARKER));
        assert!(!dir.path().join("created.txt").exists());
    }

    #[tokio::test]
    async fn test_shell_consumes_following_code_block() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in(Environment::default(), dir.path(), "/shell\n```bash\necho from-block\n```\ndone").await;
        assert_eq!(result.output, "from-block\ndone");
    }

    #[tokio::test]
    async fn test_agent_mention_defers_rest_of_body() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in(Environment::default(), dir.path(), "Intro @agentA do $thing").await;
        let invocation = result.agent_invocation.unwrap();
        assert_eq!(invocation.name, "agentA");
        assert_eq!(invocation.context, "Intro ");
        assert_eq!(invocation.prompt, " do $thing");
        assert_eq!(invocation.deferred_nodes.len(), 2);
        assert!(!result.is_local_command);
        assert!(result.transitions.contains(&CompileState::AgentDispatch));
        assert_eq!(result.output, "Intro ");
    }

    #[tokio::test]
    async fn test_undeclared_agent_is_dispatch_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::default().with_config(CompilerConfig {
            allow_undeclared_agents: false,
            ..Default::default()
        });
        let source = "---\nagents:\n  - helper\n---\n@helper and @stranger";
        let result = compile_in(env, dir.path(), source).await;
        assert_eq!(result.agent_invocation.map(|a| a.name).as_deref(), Some("helper"));
        assert_eq!(result.dispatch_error, None);

        let env = Environment::default().with_config(CompilerConfig {
            allow_undeclared_agents: false,
            ..Default::default()
        });
        let result = compile_in(env, dir.path(), "ask @stranger").await;
        assert_eq!(
            result.dispatch_error,
            Some(AgentDispatchError::UnknownAgent("stranger".to_string()))
        );
        assert!(result.agent_invocation.is_none());
        assert_eq!(result.output, "ask @stranger");
    }

    #[tokio::test]
    async fn test_next_job_sources() {
        let dir = tempfile::tempdir().unwrap();
        let source = "---\nafterStreaming: { execute(\"second.shire\") }\n---\n[flow]: third.shire\nbody";
        let result = compile_in(Environment::default(), dir.path(), source).await;
        assert_eq!(result.next_job.map(|j| j.path).as_deref(), Some("second.shire"));
        assert!(!result.is_local_command);
        assert_eq!(result.output, "\nbody");

        let result = compile_in(Environment::default(), dir.path(), "[flow]: third.shire\nbody").await;
        assert_eq!(result.next_job.map(|j| j.path).as_deref(), Some("third.shire"));
    }

    #[tokio::test]
    async fn test_reference_links_and_quoted_sigils_are_text() {
        let dir = tempfile::tempdir().unwrap();
        let source = "See [1]: https://example.com\n[1]: https://example.com\n[//]: # note\nReply with \"thanks @team\" please, or 'run /file:a.rs' now.";
        let result = compile_in(Environment::default(), dir.path(), source).await;
        assert_eq!(result.output, source);
        assert!(result.agent_invocation.is_none());
        assert!(result.is_local_command);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_when_guards_body() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystemContext::new(dir.path()).with_current_file(dir.path().join("demo.shire"));
        let compiler = Compiler::new(Arc::new(Environment::default()));

        let source = "---\nvariables:\n  mode: \"review\"\nwhen: { $fileName.endsWith(\".shire\") && $mode == \"review\" }\n---\nrunning $mode";
        let result = compiler.compile(source, &fs, HashMap::new()).await;
        assert!(result.condition_met);
        assert_eq!(result.output, "running review");

        let source = "---\nwhen: { $fileName.startsWith(\"other\") || $fileName.contains(\"x\") }\nafterStreaming: { execute(\"next.shire\") }\n---\nrunning";
        let result = compiler.compile(source, &fs, HashMap::new()).await;
        assert!(!result.condition_met);
        assert!(!result.has_error);
        assert_eq!(result.output, "");
        assert_eq!(result.next_job, None);
        assert_eq!(result.warnings, vec!["`when` condition is false, body skipped"]);
        assert_eq!(result.state, CompileState::Done);

        let result = compiler
            .compile("---\nwhen: { $undefined == 1 }\n---\nbody", &fs, HashMap::new())
            .await;
        assert!(!result.condition_met);
        assert!(result.warnings[0].contains("undefined"));
    }

    #[tokio::test]
    async fn test_execute_in_variables_compiles_one_hop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("child.shire"),
            "---\nvariables:\n  deeper: { execute(\"grandchild.shire\") }\n---\nchild saw $topic",
        )
        .unwrap();
        std::fs::write(dir.path().join("grandchild.shire"), "never").unwrap();
        let source = "---\nvariables:\n  topic: \"rust\"\n  child: { execute(\"child.shire\", $topic) }\n---\n$child";
        let result = compile_in(Environment::default(), dir.path(), source).await;
        assert!(!result.has_error);
        assert_eq!(result.output, "child saw rust");
    }

    #[tokio::test]
    async fn test_cancelled_before_body() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Compiler::new(Arc::new(Environment::default()))
            .compile_with_cancellation("hello $x", &FileSystemContext::new(dir.path()), HashMap::new(), cancel)
            .await;
        assert!(result.has_error);
        assert!(result.is_cancelled());
        assert_eq!(result.output, "");
    }

    #[tokio::test]
    async fn test_overrides_and_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystemContext::new(dir.path()).with_current_file(dir.path().join("demo.shire"));
        let mut overrides = HashMap::new();
        overrides.insert("x".to_string(), serde_json::json!("from caller"));
        let source = "---\nvariables:\n  x: \"declared\"\n---\n$x in $fileName";
        let result = Compiler::new(Arc::new(Environment::default()))
            .compile(source, &fs, overrides)
            .await;
        assert_eq!(result.output, "from caller in demo.shire");
        assert_eq!(
            result.variables.get("x").map(|v| v.scope),
            Some(VariableScope::System)
        );
    }

    #[tokio::test]
    async fn test_malformed_front_matter_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = compile_in(Environment::default(), dir.path(), "---\nenabled: maybe\n---\nbody").await;
        assert!(result.has_error);
        assert_eq!(result.state, CompileState::Error);
        assert!(result.error_message.unwrap().contains("enabled"));
        assert_eq!(result.output, "");
    }
}
