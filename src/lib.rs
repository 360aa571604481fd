//! # Shire: a scripting language for prompt workflows
//!
//! A Shire script is a markdown-like document with an optional YAML-like
//! front-matter. The header declares variables, lifecycle hooks, foreign
//! functions and agents; the body mixes plain text with agent mentions
//! (`@agent`), local commands (`/file:src/main.rs#L1-L10`), variable
//! references (`$code`) and fenced code blocks.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Source → Tokenizer → Parser → Variable Resolution → Compiler → Streaming / Post-processing
//! ```
//!
//! ### Stage 1: Tokenization
//!
//! The [`tokenizer`] module turns the source into a lossless token stream;
//! concatenating the token texts always gives back the input.
//!
//! ### Stage 2: Parsing
//!
//! The [`preprocessor`] groups front-matter tokens into header lines and the
//! [`analyzer`] builds a [`Document`] with parser combinators. Body errors
//! are recovered locally and kept as error nodes.
//!
//! ### Stage 3: Variable Resolution
//!
//! The [`variable`] engine selects each declared variable's source (files
//! matching a pattern, a literal or nothing) and runs its function pipeline,
//! recording every step in a [`variable::VariableTable`].
//!
//! ### Stage 4: Compilation
//!
//! The [`compiler`] walks the body, runs local [`command`]s behind the shell
//! safety checker and either finishes locally or hands the rest of the body
//! to an agent.
//!
//! ### Stage 5: Streaming
//!
//! The [`streaming`] pipeline notifies observers about every chunk and runs
//! the post-processor chain named in `onStreamingEnd`.
//!
//! [`snapshot`] captures compiled runs and [`plan`] reads markdown plans.

pub mod analyzer;
pub mod ast;
pub mod command;
pub mod compiler;
pub mod config;
pub mod error;
pub mod language;
pub mod plan;
pub mod preprocessor;
pub mod snapshot;
pub mod source;
pub mod streaming;
pub mod tokenizer;
pub mod variable;

// Re-exports
pub use ast::*;
pub use compiler::{compile_file, CompiledResult, Compiler, Environment};
pub use config::CompilerConfig;
pub use error::*;
pub use source::FileSystemContext;
pub use streaming::{StreamingPipeline, StreamingSession};

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
