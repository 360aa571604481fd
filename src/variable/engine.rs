use std::collections::VecDeque;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    NamedReference, ResolverContext, ResolverRegistry, Value, VariableResolutionError, VariableScope, VariableTable,
};
use crate::ast::{CaseBranch, FunctionCall, SourcePattern, VariableDeclaration};

/// One function applied by [`VariableEngine::run_pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedStep {
    pub function: String,
    /// Arguments after substitution.
    pub args: Vec<serde_json::Value>,
    pub value: Value,
    /// Index into the table's operation arena.
    pub operation: usize,
}

/// A failed pipeline with the operations it recorded before failing.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineFailure {
    pub error: VariableResolutionError,
    pub operations: Vec<usize>,
}

enum StepOutcome<'p> {
    Applied(Vec<serde_json::Value>, Value),
    Branch(&'p CaseBranch),
    NoBranch(String),
}

/// Evaluates declarations one after another against a [`VariableTable`].
pub struct VariableEngine<'a> {
    registry: &'a ResolverRegistry,
    context: ResolverContext,
    cancel: CancellationToken,
}

impl<'a> VariableEngine<'a> {
    pub fn new(registry: &'a ResolverRegistry, context: ResolverContext, cancel: CancellationToken) -> Self {
        Self {
            registry,
            context,
            cancel,
        }
    }

    /// Resolves every declaration in order and returns the warnings raised by
    /// optional variables.
    ///
    /// A failing required variable, or cancellation, ends resolution with an
    /// error. Names already in the table (overrides, system values) are
    /// skipped.
    pub async fn resolve(
        &self,
        declarations: &[VariableDeclaration],
        table: &mut VariableTable,
    ) -> Result<Vec<String>, VariableResolutionError> {
        let mut warnings = Vec::new();

        for (index, declaration) in declarations.iter().enumerate() {
            if table.contains(&declaration.name) {
                debug!("variable `{}` already set, skipping", declaration.name);
                continue;
            }
            let later = &declarations[index + 1..];
            let mut history = Vec::new();

            match self.resolve_one(declaration, later, table, &mut history).await {
                Ok(value) => {
                    table.insert_with_history(&declaration.name, value, VariableScope::UserDefined, history);
                }
                Err(VariableResolutionError::Cancelled) => return Err(VariableResolutionError::Cancelled),
                Err(err) if declaration.required => {
                    return Err(VariableResolutionError::RequiredFailed {
                        variable: declaration.name.clone(),
                        cause: Box::new(err),
                    })
                }
                Err(err) => {
                    warn!("optional variable `{}` failed: {}", declaration.name, err);
                    warnings.push(err.to_string());
                    table.insert_with_history(
                        &declaration.name,
                        Value::String(String::new()),
                        VariableScope::UserDefined,
                        history,
                    );
                }
            }
        }
        Ok(warnings)
    }

    async fn resolve_one(
        &self,
        declaration: &VariableDeclaration,
        later: &[VariableDeclaration],
        table: &mut VariableTable,
        history: &mut Vec<usize>,
    ) -> Result<Value, VariableResolutionError> {
        self.check_cancelled()?;
        let initial = self.select_source(declaration).await?;
        let (value, steps) = self
            .run_pipeline(&declaration.name, &declaration.pipeline, initial, later, table)
            .await
            .map_err(|failure| {
                history.extend(failure.operations);
                failure.error
            })?;
        history.extend(steps.iter().map(|step| step.operation));
        Ok(value)
    }

    /// Folds `pipeline` over `initial`, recording each step under `variable`.
    ///
    /// A `case` step is replaced by the pipeline of its selected branch.
    pub async fn run_pipeline(
        &self,
        variable: &str,
        pipeline: &[FunctionCall],
        initial: Value,
        later: &[VariableDeclaration],
        table: &mut VariableTable,
    ) -> Result<(Value, Vec<AppliedStep>), PipelineFailure> {
        let mut steps: Vec<AppliedStep> = Vec::new();
        let mut pending: VecDeque<&FunctionCall> = pipeline.iter().collect();
        let mut value = initial;

        while let Some(call) = pending.pop_front() {
            let step = self.apply_step(variable, call, &value, later, table).await;
            match step {
                Ok(StepOutcome::Branch(branch)) => {
                    debug!("`{}` takes case branch {}", variable, branch);
                    for next in branch.pipeline.iter().rev() {
                        pending.push_front(next);
                    }
                }
                Ok(StepOutcome::NoBranch(subject)) => {
                    debug!("`{}` has no case branch for {:?}", variable, subject);
                    value = Value::String(String::new());
                    let operation = table.record(variable, &call.name, value.clone());
                    steps.push(AppliedStep {
                        function: call.name.clone(),
                        args: call.args.clone(),
                        value: value.clone(),
                        operation,
                    });
                }
                Ok(StepOutcome::Applied(args, next)) => {
                    value = next;
                    let operation = table.record(variable, &call.name, value.clone());
                    steps.push(AppliedStep {
                        function: call.name.clone(),
                        args,
                        value: value.clone(),
                        operation,
                    });
                }
                Err(error) => {
                    return Err(PipelineFailure {
                        error,
                        operations: steps.iter().map(|s| s.operation).collect(),
                    })
                }
            }
        }
        Ok((value, steps))
    }

    async fn apply_step<'p>(
        &self,
        variable: &str,
        call: &'p FunctionCall,
        value: &Value,
        later: &[VariableDeclaration],
        table: &VariableTable,
    ) -> Result<StepOutcome<'p>, VariableResolutionError> {
        self.check_cancelled()?;
        if call.is_case_match() {
            let subject = case_subject(call, value, table);
            let branch = call
                .branches
                .iter()
                .find(|b| b.matches(&subject))
                .or_else(|| call.branches.iter().find(|b| b.pattern.is_none()));
            return Ok(match branch {
                Some(branch) => StepOutcome::Branch(branch),
                None => StepOutcome::NoBranch(subject),
            });
        }
        let resolver = self
            .registry
            .lookup(&call.name)
            .ok_or_else(|| VariableResolutionError::UnknownFunction {
                variable: variable.to_string(),
                function: call.name.clone(),
            })?;
        let args = substitute_args(call, variable, later, table, resolver.named_references())?;
        let next = resolver
            .apply(value.clone(), &args, &self.context)
            .await
            .map_err(|e| step_error(variable, call, e))?;
        Ok(StepOutcome::Applied(args, next))
    }

    async fn select_source(&self, declaration: &VariableDeclaration) -> Result<Value, VariableResolutionError> {
        match &declaration.source {
            SourcePattern::Regex(pattern) => {
                let regex = Regex::new(pattern).map_err(|e| VariableResolutionError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                let files = self.context.source.resolve(&self.context.fs, &regex).await?;
                if files.is_empty() {
                    return Err(VariableResolutionError::MissingSource {
                        variable: declaration.name.clone(),
                        pattern: pattern.clone(),
                    });
                }
                Ok(Value::lines(files))
            }
            SourcePattern::Literal(text) => Ok(Value::String(text.clone())),
            SourcePattern::None => Ok(Value::String(String::new())),
        }
    }

    fn check_cancelled(&self) -> Result<(), VariableResolutionError> {
        if self.cancel.is_cancelled() {
            return Err(VariableResolutionError::Cancelled);
        }
        Ok(())
    }
}

/// Errors raised by a resolver keep their kind; anything else is wrapped
/// with the failing step.
fn step_error(variable: &str, call: &FunctionCall, err: VariableResolutionError) -> VariableResolutionError {
    match err {
        VariableResolutionError::Cancelled
        | VariableResolutionError::InvalidArgument { .. }
        | VariableResolutionError::InvalidPattern { .. } => err,
        other => VariableResolutionError::StepFailed {
            variable: variable.to_string(),
            function: call.name.clone(),
            message: other.to_string(),
        },
    }
}

/// Replaces `$name` arguments with the text of already resolved variables,
/// or with a [`NamedReference`] when `named` is set.
fn substitute_args(
    call: &FunctionCall,
    variable: &str,
    later: &[VariableDeclaration],
    table: &VariableTable,
    named: bool,
) -> Result<Vec<serde_json::Value>, VariableResolutionError> {
    call.args
        .iter()
        .map(|arg| match arg.as_str().and_then(|s| s.strip_prefix('$')) {
            Some(reference) if !reference.is_empty() => match table.value(reference) {
                Some(value) if named => Ok(NamedReference::new(reference, value.to_string()).to_json()),
                Some(value) => Ok(serde_json::Value::String(value.to_string())),
                None if later.iter().any(|d| d.name == reference) => {
                    Err(VariableResolutionError::ForwardReference {
                        variable: variable.to_string(),
                        reference: reference.to_string(),
                    })
                }
                None => Err(VariableResolutionError::UnknownReference {
                    variable: variable.to_string(),
                    reference: reference.to_string(),
                }),
            },
            _ => Ok(arg.clone()),
        })
        .collect()
}

/// The text a `case` step matches on. A `$name` subject reads the table,
/// falling back to the first line of the incoming value.
fn case_subject(call: &FunctionCall, previous: &Value, table: &VariableTable) -> String {
    let subject = call.first_arg_text().unwrap_or_default();
    match subject.strip_prefix('$') {
        Some(name) => match table.value(name) {
            Some(value) => value.to_string().trim().to_string(),
            None => previous.as_lines().into_iter().next().unwrap_or_default().trim().to_string(),
        },
        None => subject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FileSystemContext, FileSystemSourceResolver};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn declaration(name: &str, source: SourcePattern, pipeline: Vec<FunctionCall>, required: bool) -> VariableDeclaration {
        VariableDeclaration {
            name: name.to_string(),
            source,
            pipeline,
            required,
        }
    }

    fn context(root: &std::path::Path) -> ResolverContext {
        ResolverContext {
            fs: FileSystemContext::new(root),
            source: Arc::new(FileSystemSourceResolver::new()),
            executor: None,
        }
    }

    #[tokio::test]
    async fn test_pipeline_history() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "ok\nERROR one\nERROR two\n").unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());

        let decls = vec![declaration(
            "errors",
            SourcePattern::Regex(r"\.log$".to_string()),
            vec![
                FunctionCall::new("read", vec![]),
                FunctionCall::new("grep", vec![json!("ERROR .*")]),
                FunctionCall::new("head", vec![json!(1)]),
            ],
            true,
        )];
        let mut table = VariableTable::new();
        let warnings = engine.resolve(&decls, &mut table).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(table.value("errors"), Some(&Value::lines(["ERROR one"])));

        let history = table.history("errors");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value_after, Value::text("ok\nERROR one\nERROR two\n"));
        assert_eq!(history[1].value_after, Value::lines(["ERROR one", "ERROR two"]));
    }

    #[tokio::test]
    async fn test_case_selects_branch_by_subject() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());
        let case = |subject: &str| {
            FunctionCall::case_match(
                subject,
                vec![
                    CaseBranch {
                        pattern: Some("error".to_string()),
                        pipeline: vec![
                            FunctionCall::new("print", vec![json!("failed")]),
                            FunctionCall::new("sed", vec![json!("f"), json!("F")]),
                        ],
                    },
                    CaseBranch {
                        pattern: None,
                        pipeline: vec![FunctionCall::new("print", vec![json!("fine")])],
                    },
                ],
            )
        };

        let mut table = VariableTable::new();
        table.insert("output", Value::text("error\n"), VariableScope::System);
        let (value, steps) = engine
            .run_pipeline("hook", &[case("$output")], Value::Null, &[], &mut table)
            .await
            .unwrap();
        assert_eq!(value, Value::text("Failed"));
        assert_eq!(
            steps.iter().map(|s| s.function.as_str()).collect::<Vec<_>>(),
            vec!["print", "sed"]
        );

        let (value, _) = engine
            .run_pipeline("hook", &[case("$missing")], Value::lines(["ok", "error"]), &[], &mut table)
            .await
            .unwrap();
        assert_eq!(value, Value::text("fine"));

        let only_error = FunctionCall::case_match(
            "warn",
            vec![CaseBranch {
                pattern: Some("error".to_string()),
                pipeline: vec![FunctionCall::new("print", vec![json!("x")])],
            }],
        );
        let (value, steps) = engine
            .run_pipeline("hook", &[only_error], Value::text("input"), &[], &mut table)
            .await
            .unwrap();
        assert_eq!(value, Value::text(""));
        assert_eq!(steps[0].function, "caseMatch");
    }

    #[tokio::test]
    async fn test_named_references_keep_their_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());
        let mut table = VariableTable::new();
        table.insert("output", Value::text("done"), VariableScope::System);

        let failure = engine
            .run_pipeline(
                "hook",
                &[FunctionCall::new("execute", vec![json!("next.shire"), json!("$output")])],
                Value::Null,
                &[],
                &mut table,
            )
            .await
            .unwrap_err();
        assert!(failure.error.to_string().contains("cannot be executed"));
        assert!(failure.operations.is_empty());

        let call = FunctionCall::new("execute", vec![json!("$output")]);
        let named = substitute_args(&call, "hook", &[], &table, true).unwrap();
        assert_eq!(named, vec![NamedReference::new("output", "done").to_json()]);
        let plain = substitute_args(&call, "hook", &[], &table, false).unwrap();
        assert_eq!(plain, vec![json!("done")]);
    }

    #[tokio::test]
    async fn test_references_and_forward_references() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());

        let decls = vec![
            declaration("greeting", SourcePattern::Literal("hello".to_string()), vec![], false),
            declaration(
                "echo",
                SourcePattern::None,
                vec![FunctionCall::new("print", vec![json!("$greeting"), json!("$later")])],
                false,
            ),
            declaration("later", SourcePattern::Literal("x".to_string()), vec![], false),
        ];
        let mut table = VariableTable::new();
        let warnings = engine.resolve(&decls, &mut table).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("before it is declared"));
        assert_eq!(table.value("echo"), Some(&Value::text("")));
        assert_eq!(table.value("later"), Some(&Value::text("x")));
    }

    #[tokio::test]
    async fn test_required_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());

        let decls = vec![declaration(
            "x",
            SourcePattern::Literal("a".to_string()),
            vec![
                FunctionCall::new("trim", vec![]),
                FunctionCall::new("explode", vec![]),
            ],
            true,
        )];
        let mut table = VariableTable::new();
        let err = engine.resolve(&decls, &mut table).await.unwrap_err();
        match err {
            VariableResolutionError::RequiredFailed { variable, cause } => {
                assert_eq!(variable, "x");
                assert!(matches!(*cause, VariableResolutionError::UnknownFunction { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(table.operations().len(), 1);
        assert!(!table.contains("x"));
    }

    #[tokio::test]
    async fn test_overrides_are_not_resolved_and_cancel_stops() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let cancel = CancellationToken::new();
        let engine = VariableEngine::new(&registry, context(dir.path()), cancel.clone());

        let mut table = VariableTable::new();
        table.insert("x", Value::text("override"), VariableScope::System);
        let decls = vec![
            declaration("x", SourcePattern::Literal("declared".to_string()), vec![], true),
            declaration("y", SourcePattern::Literal("y".to_string()), vec![], false),
        ];
        cancel.cancel();
        let err = engine.resolve(&decls, &mut table).await.unwrap_err();
        assert_eq!(err, VariableResolutionError::Cancelled);
        assert_eq!(table.value("x"), Some(&Value::text("override")));
        assert!(!table.contains("y"));
    }

    #[tokio::test]
    async fn test_missing_source_for_optional_variable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResolverRegistry::with_builtins();
        let engine = VariableEngine::new(&registry, context(dir.path()), CancellationToken::new());
        let decls = vec![declaration("none", SourcePattern::Regex("zzz".to_string()), vec![], false)];
        let mut table = VariableTable::new();
        let warnings = engine.resolve(&decls, &mut table).await.unwrap();
        assert!(warnings[0].contains("no source matches"));
        assert_eq!(table.value("none"), Some(&Value::text("")));
    }
}
