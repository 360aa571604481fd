use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use super::{PostProcessError, StreamingSession};
use crate::ast::value_text;
use crate::language::{LanguageTable, LanguageTraits};

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)```([^\n`]*)\n(.*?)(?:```|\z)").unwrap();
}

/// Everything a post-processor sees.
pub struct PostProcessorContext<'a> {
    pub session: &'a StreamingSession,
    /// Text as it came out of the stream.
    pub raw: &'a str,
    /// Output of the previous processor, or `raw` for the first one.
    pub output: &'a str,
    /// Arguments of the `onStreamingEnd` call, references already expanded.
    pub args: &'a [serde_json::Value],
    pub languages: &'a LanguageTable,
}

impl PostProcessorContext<'_> {
    pub fn arg_text(&self, index: usize) -> Option<String> {
        self.args.get(index).map(value_text)
    }
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Higher values run first.
    fn priority(&self) -> i32 {
        0
    }

    /// Always-on processors run without being named in `onStreamingEnd`.
    fn always_on(&self) -> bool {
        false
    }

    fn is_applicable(&self, _context: &PostProcessorContext<'_>) -> bool {
        true
    }

    async fn execute(&self, context: &PostProcessorContext<'_>) -> Result<String, PostProcessError>;
}

/// First fenced code block of `text` with its language id, if any.
pub fn first_code_block(text: &str) -> Option<(Option<String>, String)> {
    CODE_FENCE.captures(text).map(|caps| {
        let language = caps
            .get(1)
            .map(|m| m.as_str().trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let code = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        (language, code.trim_end_matches('\n').to_string())
    })
}

/// `parseCode`: keeps only the first fenced code block.
pub struct ParseCodeProcessor;

#[async_trait]
impl PostProcessor for ParseCodeProcessor {
    fn name(&self) -> &str {
        "parseCode"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn execute(&self, context: &PostProcessorContext<'_>) -> Result<String, PostProcessError> {
        Ok(first_code_block(context.output)
            .map(|(_, code)| code)
            .unwrap_or_else(|| context.output.to_string()))
    }
}

/// `parseComment`: keeps only the first documentation comment.
pub struct ParseCommentProcessor;

impl ParseCommentProcessor {
    fn language<'t>(context: &PostProcessorContext<'t>) -> Option<&'t LanguageTraits> {
        let from_block = first_code_block(context.output)
            .and_then(|(language, _)| language)
            .and_then(|id| context.languages.get(&id));
        from_block.or_else(|| {
            context
                .session
                .fs
                .current_file
                .as_ref()
                .and_then(|file| context.languages.for_path(&file.to_string_lossy()))
        })
    }
}

/// Extracts the first doc comment delimited by `start`/`end`. An empty `end`
/// means consecutive line comments.
pub fn extract_doc_comment(text: &str, start: &str, end: &str) -> Option<String> {
    if end.is_empty() {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim_start)
            .skip_while(|line| !line.starts_with(start))
            .take_while(|line| line.starts_with(start))
            .map(|line| line[start.len()..].trim())
            .collect();
        return (!lines.is_empty()).then(|| lines.join("\n"));
    }

    let begin = text.find(start)?;
    let rest = &text[begin + start.len()..];
    let close = rest.find(end)?;
    let lines: Vec<&str> = rest[..close]
        .lines()
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .collect();
    Some(lines.join("\n"))
}

#[async_trait]
impl PostProcessor for ParseCommentProcessor {
    fn name(&self) -> &str {
        "parseComment"
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn execute(&self, context: &PostProcessorContext<'_>) -> Result<String, PostProcessError> {
        let (start, end) = Self::language(context)
            .map(|traits| traits.doc_comment)
            .unwrap_or(("/**", "*/"));
        Ok(extract_doc_comment(context.output, start, end).unwrap_or_default())
    }
}

/// `saveFile("path")`: writes the text inside the project root and passes it on.
pub struct SaveFileProcessor;

#[async_trait]
impl PostProcessor for SaveFileProcessor {
    fn name(&self) -> &str {
        "saveFile"
    }

    fn priority(&self) -> i32 {
        -100
    }

    async fn execute(&self, context: &PostProcessorContext<'_>) -> Result<String, PostProcessError> {
        let relative = context
            .arg_text(0)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PostProcessError::MissingArgument {
                processor: self.name().to_string(),
            })?;
        let path = context.session.fs.resolve(&relative)?;
        let io_error = |e: std::io::Error| PostProcessError::Io {
            path: relative.clone(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&path, context.output).await.map_err(io_error)?;
        info!("saved {} bytes to {}", context.output.len(), relative);
        Ok(context.output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_code_block() {
        let text = "Here:\n```rust\nfn main() {}\n```\nand more\n```\nx\n```";
        assert_eq!(
            first_code_block(text),
            Some((Some("rust".to_string()), "fn main() {}".to_string()))
        );
        assert_eq!(
            first_code_block("```\nunterminated"),
            Some((None, "unterminated".to_string()))
        );
        assert_eq!(first_code_block("no code"), None);
    }

    #[test]
    fn test_extract_doc_comment() {
        let java = "class A {\n  /**\n   * Adds numbers.\n   * Returns the sum.\n   */\n  int add() {}\n}";
        assert_eq!(
            extract_doc_comment(java, "/**", "*/"),
            Some("Adds numbers.\nReturns the sum.".to_string())
        );

        let rust = "use x;\n/// Adds numbers.\n/// Returns the sum.\nfn add() {}";
        assert_eq!(
            extract_doc_comment(rust, "///", ""),
            Some("Adds numbers.\nReturns the sum.".to_string())
        );
        assert_eq!(extract_doc_comment("fn f() {}", "///", ""), None);
    }
}
