//! # Streaming pipeline
//!
//! Wraps a run with ordered observer hooks and a post-processor chain:
//!
//! ```text
//! on_before_streaming → on_streaming(chunk)* → after_streaming_done → post-processors
//! ```
//!
//! Observers only watch. The chain runs once after the stream ends; every
//! processor receives the previous processor's output.

pub mod observer;
pub mod post_processor;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{pin_mut, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ast::{FrontMatterBlock, FunctionCall, HookKind};
use crate::compiler::CompiledResult;
use crate::language::LanguageTable;
use crate::source::{FileSystemContext, SourceError};
use crate::variable::VariableTable;

pub use observer::{LoggingObserver, ProfilingObserver, StreamingObserver, StreamingProfile};
pub use post_processor::{
    extract_doc_comment, first_code_block, ParseCodeProcessor, ParseCommentProcessor, PostProcessor,
    PostProcessorContext, SaveFileProcessor,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PostProcessError {
    #[error("`{processor}` requires an argument")]
    MissingArgument { processor: String },
    #[error("failed to write `{path}`: {message}")]
    Io { path: String, message: String },
    #[error("`{processor}` failed: {message}")]
    Failed { processor: String, message: String },
    #[error("streaming cancelled")]
    Cancelled,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// One streamed unit of work.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub run_id: Uuid,
    pub fs: FileSystemContext,
    pub front_matter: Option<FrontMatterBlock>,
    /// Values for `$name` arguments of post-processors.
    pub variables: VariableTable,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl StreamingSession {
    pub fn new(fs: FileSystemContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fs,
            front_matter: None,
            variables: VariableTable::new(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Session for a compiled script, carrying its front-matter and variables.
    pub fn from_compiled(compiled: &CompiledResult, fs: FileSystemContext) -> Self {
        Self {
            front_matter: compiled.resolved_config.clone(),
            variables: compiled.variables.clone(),
            ..Self::new(fs)
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn hook_calls(&self, kind: HookKind) -> &[FunctionCall] {
        self.front_matter
            .as_ref()
            .and_then(|fm| fm.hook(kind))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamingOutcome {
    /// Concatenated chunks.
    pub raw: String,
    /// Text after the post-processor chain.
    pub output: String,
    /// Processors that ran, in order.
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct StreamingPipeline {
    observers: Vec<Arc<dyn StreamingObserver>>,
    processors: Vec<Arc<dyn PostProcessor>>,
    languages: Arc<LanguageTable>,
}

impl Default for StreamingPipeline {
    fn default() -> Self {
        Self::new(Arc::new(LanguageTable::builtin()))
    }
}

impl StreamingPipeline {
    pub fn new(languages: Arc<LanguageTable>) -> Self {
        Self {
            observers: Vec::new(),
            processors: Vec::new(),
            languages,
        }
    }

    /// Pipeline with the logging observer and the built-in processors.
    pub fn with_builtins(languages: Arc<LanguageTable>) -> Self {
        let mut pipeline = Self::new(languages);
        pipeline.register_streaming_observer(Arc::new(LoggingObserver));
        pipeline.register_post_processor(Arc::new(ParseCodeProcessor));
        pipeline.register_post_processor(Arc::new(ParseCommentProcessor));
        pipeline.register_post_processor(Arc::new(SaveFileProcessor));
        pipeline
    }

    pub fn register_streaming_observer(&mut self, observer: Arc<dyn StreamingObserver>) {
        debug!("registered streaming observer `{}`", observer.name());
        self.observers.push(observer);
    }

    pub fn register_post_processor(&mut self, processor: Arc<dyn PostProcessor>) {
        debug!("registered post-processor `{}`", processor.name());
        self.processors.push(processor);
    }

    pub fn post_processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Consumes `stream`, notifying observers, then runs the chain.
    pub async fn run<S>(&self, session: &StreamingSession, stream: S) -> Result<StreamingOutcome, PostProcessError>
    where
        S: Stream<Item = String> + Send,
    {
        let (observers, warnings) = self.select_observers(session.hook_calls(HookKind::OnStreaming));
        for observer in &observers {
            observer.on_before_streaming(session).await;
        }

        let mut raw = String::new();
        pin_mut!(stream);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Err(PostProcessError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            for observer in &observers {
                observer.on_streaming(session, &chunk).await;
            }
            raw.push_str(&chunk);
        }

        for observer in &observers {
            observer.after_streaming_done(session, &raw).await;
        }
        self.post_process(session, raw, warnings).await
    }

    /// Observers named by `calls` or always on, in registration order, and
    /// a warning per unknown name.
    fn select_observers<'s>(&'s self, calls: &[FunctionCall]) -> (Vec<&'s Arc<dyn StreamingObserver>>, Vec<String>) {
        let mut warnings = Vec::new();
        for call in calls {
            if !self.observers.iter().any(|o| o.name() == call.name) {
                warn!("unknown streaming observer `{}`", call.name);
                warnings.push(format!("unknown streaming observer `{}`", call.name));
            }
        }
        let selected = self
            .observers
            .iter()
            .filter(|o| o.always_on() || calls.iter().any(|call| call.name == o.name()))
            .collect();
        (selected, warnings)
    }

    /// Consumes chunks sent by another task until the sender is dropped.
    pub async fn run_channel(
        &self,
        session: &StreamingSession,
        receiver: mpsc::Receiver<String>,
    ) -> Result<StreamingOutcome, PostProcessError> {
        self.run(session, ReceiverStream::new(receiver)).await
    }

    /// Runs a local result through the pipeline as a single chunk.
    pub async fn run_local(
        &self,
        session: &StreamingSession,
        compiled: &CompiledResult,
    ) -> Result<StreamingOutcome, PostProcessError> {
        self.run(session, futures::stream::iter(vec![compiled.output.clone()]))
            .await
    }

    /// Processors in run order with the call that selected them. Ties keep
    /// registration order.
    fn schedule<'s>(&'s self, calls: &'s [FunctionCall]) -> Vec<(&'s Arc<dyn PostProcessor>, Option<&'s FunctionCall>)> {
        let mut scheduled: Vec<_> = self
            .processors
            .iter()
            .filter_map(|processor| {
                let call = calls.iter().find(|call| call.name == processor.name());
                (call.is_some() || processor.always_on()).then_some((processor, call))
            })
            .collect();
        scheduled.sort_by_key(|(processor, _)| std::cmp::Reverse(processor.priority()));
        scheduled
    }

    async fn post_process(
        &self,
        session: &StreamingSession,
        raw: String,
        warnings: Vec<String>,
    ) -> Result<StreamingOutcome, PostProcessError> {
        let calls = session.hook_calls(HookKind::OnStreamingEnd);
        let mut outcome = StreamingOutcome {
            output: raw.clone(),
            raw,
            warnings,
            ..Default::default()
        };

        for call in calls {
            if !self.processors.iter().any(|p| p.name() == call.name) {
                warn!("unknown post-processor `{}`", call.name);
                outcome.warnings.push(format!("unknown post-processor `{}`", call.name));
            }
        }

        for (processor, call) in self.schedule(calls) {
            if session.cancel.is_cancelled() {
                return Err(PostProcessError::Cancelled);
            }
            let args = call
                .map(|call| expand_args(&call.args, &outcome.output, &session.variables))
                .unwrap_or_default();
            let context = PostProcessorContext {
                session,
                raw: &outcome.raw,
                output: &outcome.output,
                args: &args,
                languages: &self.languages,
            };
            if !processor.is_applicable(&context) {
                debug!("post-processor `{}` not applicable", processor.name());
                continue;
            }
            let output = processor.execute(&context).await?;
            outcome.output = output;
            outcome.applied.push(processor.name().to_string());
        }
        Ok(outcome)
    }
}

/// Replaces `$output` with the current text and `$name` with a variable value.
fn expand_args(args: &[serde_json::Value], output: &str, variables: &VariableTable) -> Vec<serde_json::Value> {
    args.iter()
        .map(|arg| match arg {
            serde_json::Value::String(s) if s == "$output" => serde_json::Value::String(output.to_string()),
            serde_json::Value::String(s) if s.starts_with('$') => serde_json::Value::String(
                variables
                    .value(&s[1..])
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            other => other.clone(),
        })
        .collect()
}
