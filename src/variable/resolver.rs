use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::warn;

use super::{Value, VariableResolutionError};
use crate::ast::value_text;
use crate::source::{FileSystemContext, SourceResolver};

lazy_static! {
    static ref MARKDOWN_LINK: Regex = Regex::new(r"\[[^\]]*\]\(\s*<?([^)\s>]+)>?[^)]*\)").unwrap();
    static ref MARKDOWN_HEADING: Regex = Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$").unwrap();
    static ref MARKDOWN_CODE: Regex = Regex::new(r"(?ms)^```[^\n]*\n(.*?)^```").unwrap();
}

/// What a pipeline function may reach while it runs.
#[derive(Clone)]
pub struct ResolverContext {
    pub fs: FileSystemContext,
    pub source: Arc<dyn SourceResolver>,
    /// Runs `execute(...)` steps. Without one those steps fail.
    pub executor: Option<Arc<dyn ScriptExecutor>>,
}

/// A `$name` argument passed with its name, for resolvers that bind
/// variables instead of reading their text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedReference {
    pub name: String,
    pub value: String,
}

impl NamedReference {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name, "value": self.value })
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Compiles another script on behalf of an `execute` step.
#[mockall::automock]
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Output of the script at `path`, compiled with `variables` bound.
    async fn execute(
        &self,
        path: &str,
        variables: Vec<NamedReference>,
        ctx: &ResolverContext,
    ) -> Result<String, VariableResolutionError>;
}

/// One pipeline function. `args` have `$name` references already substituted.
#[async_trait]
pub trait VariableResolver: Send + Sync {
    fn name(&self) -> &str;

    /// When true, `$name` arguments arrive as [`NamedReference`] objects.
    fn named_references(&self) -> bool {
        false
    }

    async fn apply(
        &self,
        previous: Value,
        args: &[serde_json::Value],
        ctx: &ResolverContext,
    ) -> Result<Value, VariableResolutionError>;
}

#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn VariableResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for function in BuiltinFunction::iter() {
            registry.register(Arc::new(Builtin(function)));
        }
        registry
    }

    /// Registers a resolver, replacing any previous one with the same name.
    pub fn register(&mut self, resolver: Arc<dyn VariableResolver>) {
        self.resolvers.insert(resolver.name().to_string(), resolver);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn VariableResolver>> {
        self.resolvers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resolvers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display, strum::EnumIter, strum::AsRefStr,
)]
#[strum(serialize_all = "camelCase")]
pub enum BuiltinFunction {
    Read,
    Cat,
    Grep,
    Find,
    Sed,
    Sort,
    Uniq,
    Head,
    Tail,
    LineNo,
    Join,
    Split,
    Trim,
    Print,
    Xargs,
    #[strum(serialize = "jsonpath")]
    JsonPath,
    Capture,
    Notify,
    Execute,
}

struct Builtin(BuiltinFunction);

fn invalid(function: BuiltinFunction, message: impl Into<String>) -> VariableResolutionError {
    VariableResolutionError::InvalidArgument {
        function: function.to_string(),
        message: message.into(),
    }
}

fn count_arg(function: BuiltinFunction, args: &[serde_json::Value]) -> Result<usize, VariableResolutionError> {
    match args.first() {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| invalid(function, format!("expected a count, got {}", n))),
        Some(serde_json::Value::String(s)) => s
            .parse()
            .map_err(|_| invalid(function, format!("expected a count, got {:?}", s))),
        Some(other) => Err(invalid(function, format!("expected a count, got {}", other))),
        None => Err(invalid(function, "missing count")),
    }
}

fn regex_arg(arg: &serde_json::Value) -> Result<Regex, VariableResolutionError> {
    let pattern = value_text(arg);
    Regex::new(&pattern).map_err(|e| VariableResolutionError::InvalidPattern {
        pattern,
        message: e.to_string(),
    })
}

/// Every match of every pattern, line by line. A pattern with a capture
/// group yields group 1 instead of the whole match.
fn grep_matches(lines: &[String], patterns: &[Regex]) -> Vec<String> {
    let mut matches = Vec::new();
    for line in lines {
        for pattern in patterns {
            let grouped = pattern.captures_len() > 1;
            for captures in pattern.captures_iter(line) {
                let found = if grouped { captures.get(1) } else { captures.get(0) };
                match found {
                    Some(m) if grouped || !m.as_str().is_empty() => matches.push(m.as_str().to_string()),
                    _ => {}
                }
            }
        }
    }
    matches
}

/// Looks up `$.a.b[0]` style paths. Paths starting with `/` are JSON pointers.
fn json_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.starts_with('/') {
        return root.pointer(path);
    }
    let mut current = root;
    for segment in path.strip_prefix('$').unwrap_or(path).split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = segment.split_at(segment.find('[').unwrap_or(segment.len()));
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes.split('[').filter(|s| !s.is_empty()) {
            let index: usize = index.strip_suffix(']')?.parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `data:` payloads of a server-sent event stream, joined.
fn sse_path(input: &str, path: &str) -> Option<String> {
    let parts: Vec<String> = input
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
        .filter_map(|event| json_path(&event, path).map(json_text))
        .collect();
    (!parts.is_empty()).then(|| parts.concat())
}

fn capture_nodes(
    function: BuiltinFunction,
    markdown: &str,
    node_type: &str,
) -> Result<Vec<String>, VariableResolutionError> {
    let pattern: &Regex = match node_type {
        "link" => &*MARKDOWN_LINK,
        "heading" => &*MARKDOWN_HEADING,
        "code" => &*MARKDOWN_CODE,
        other => return Err(invalid(function, format!("unsupported node type `{}`", other))),
    };
    Ok(pattern
        .captures_iter(markdown)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('\n').to_string())
        .collect())
}

#[async_trait]
impl VariableResolver for Builtin {
    fn name(&self) -> &str {
        self.0.as_ref()
    }

    fn named_references(&self) -> bool {
        self.0 == BuiltinFunction::Execute
    }

    async fn apply(
        &self,
        previous: Value,
        args: &[serde_json::Value],
        ctx: &ResolverContext,
    ) -> Result<Value, VariableResolutionError> {
        let function = self.0;
        let value = match function {
            BuiltinFunction::Read | BuiltinFunction::Cat => {
                let paths: Vec<String> = if args.is_empty() {
                    previous.as_lines()
                } else {
                    args.iter().map(value_text).collect()
                };
                let mut contents = Vec::with_capacity(paths.len());
                for path in paths.iter().filter(|p| !p.trim().is_empty()) {
                    contents.push(ctx.source.read(&ctx.fs, path.trim()).await?.to_string());
                }
                Value::String(contents.join("\n"))
            }
            BuiltinFunction::Grep => {
                if args.is_empty() {
                    return Err(invalid(function, "missing pattern"));
                }
                let patterns = args.iter().map(regex_arg).collect::<Result<Vec<_>, _>>()?;
                Value::lines(grep_matches(&previous.as_lines(), &patterns))
            }
            BuiltinFunction::Find => {
                let needle = args
                    .first()
                    .map(value_text)
                    .ok_or_else(|| invalid(function, "missing text"))?;
                Value::lines(
                    previous
                        .as_lines()
                        .into_iter()
                        .filter(|line| line.contains(&needle)),
                )
            }
            BuiltinFunction::Sed => {
                let (pattern, replacement) = match args {
                    [pattern, replacement, ..] => (regex_arg(pattern)?, value_text(replacement)),
                    _ => return Err(invalid(function, "expected a pattern and a replacement")),
                };
                match previous {
                    Value::List(items) => Value::lines(items.iter().map(|item| {
                        pattern
                            .replace_all(&item.to_string(), replacement.as_str())
                            .into_owned()
                    })),
                    other => Value::String(
                        pattern
                            .replace_all(&other.to_string(), replacement.as_str())
                            .into_owned(),
                    ),
                }
            }
            BuiltinFunction::Sort => {
                let mut lines = previous.as_lines();
                lines.sort();
                Value::lines(lines)
            }
            BuiltinFunction::Uniq => {
                let mut seen = std::collections::HashSet::new();
                Value::lines(
                    previous
                        .as_lines()
                        .into_iter()
                        .filter(|line| seen.insert(line.clone())),
                )
            }
            BuiltinFunction::Head => {
                let n = count_arg(function, args)?;
                Value::lines(previous.as_lines().into_iter().take(n))
            }
            BuiltinFunction::Tail => {
                let n = count_arg(function, args)?;
                let lines = previous.as_lines();
                let skip = lines.len().saturating_sub(n);
                Value::lines(lines.into_iter().skip(skip))
            }
            BuiltinFunction::LineNo => Value::lines(
                previous
                    .as_lines()
                    .into_iter()
                    .enumerate()
                    .map(|(i, line)| format!("{} {}", i + 1, line)),
            ),
            BuiltinFunction::Join => {
                let separator = args.first().map(value_text).unwrap_or_default();
                Value::String(previous.as_lines().join(&separator))
            }
            BuiltinFunction::Split => {
                let separator = args
                    .first()
                    .map(value_text)
                    .unwrap_or_else(|| "\n".to_string());
                if separator.is_empty() {
                    return Err(invalid(function, "separator must not be empty"));
                }
                Value::lines(previous.to_string().split(separator.as_str()))
            }
            BuiltinFunction::Trim => match previous {
                Value::List(items) => Value::lines(items.iter().map(|i| i.to_string().trim().to_string())),
                other => Value::String(other.to_string().trim().to_string()),
            },
            BuiltinFunction::Print => {
                if args.is_empty() {
                    previous
                } else {
                    Value::String(args.iter().map(value_text).collect::<Vec<_>>().join(" "))
                }
            }
            BuiltinFunction::Xargs => {
                if args.is_empty() {
                    Value::lines(previous.as_lines())
                } else {
                    Value::lines(args.iter().map(value_text))
                }
            }
            BuiltinFunction::JsonPath => {
                let path = args
                    .first()
                    .map(value_text)
                    .ok_or_else(|| invalid(function, "missing path"))?;
                let sse = args
                    .get(1)
                    .is_some_and(|flag| flag.as_bool().unwrap_or_else(|| value_text(flag) == "true"));
                let input = previous.to_string();
                let found = if sse {
                    sse_path(&input, &path)
                } else {
                    let document: serde_json::Value = serde_json::from_str(&input)
                        .map_err(|e| invalid(function, format!("input is not JSON: {}", e)))?;
                    json_path(&document, &path).map(json_text)
                };
                match found {
                    Some(text) => Value::String(text),
                    None => previous,
                }
            }
            BuiltinFunction::Capture => {
                let (file, node_type) = match args {
                    [file, node_type, ..] => (value_text(file), value_text(node_type)),
                    _ => return Err(invalid(function, "expected a file and a node type")),
                };
                let markdown = ctx.source.read(&ctx.fs, file.trim()).await?;
                Value::lines(capture_nodes(function, &markdown, &node_type)?)
            }
            BuiltinFunction::Notify => {
                let message = args.iter().map(value_text).collect::<Vec<_>>().join(" ");
                if message.is_empty() {
                    warn!("notify: {}", previous);
                } else {
                    warn!("notify: {}", message);
                }
                previous
            }
            BuiltinFunction::Execute => {
                let (path, rest) = args
                    .split_first()
                    .ok_or_else(|| invalid(function, "missing script path"))?;
                let path = NamedReference::from_json(path)
                    .map(|reference| reference.value)
                    .unwrap_or_else(|| value_text(path));
                let variables = rest
                    .iter()
                    .map(|arg| {
                        NamedReference::from_json(arg).ok_or_else(|| {
                            invalid(function, format!("expected a `$name` reference, got {}", value_text(arg)))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let executor = ctx
                    .executor
                    .as_ref()
                    .ok_or_else(|| invalid(function, "scripts cannot be executed here"))?;
                Value::String(executor.execute(path.trim(), variables, ctx).await?)
            }
        };
        Ok(value)
    }
}
