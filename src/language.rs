//! Static per-language capabilities: comment syntax, doc-comment delimiters
//! and file extensions. Looked up by language id, alias or extension.

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageTraits {
    pub language_id: &'static str,
    pub aliases: &'static [&'static str],
    pub comment_prefix: &'static str,
    /// Opening and closing doc-comment markers. Line doc comments have an
    /// empty closing marker.
    pub doc_comment: (&'static str, &'static str),
    pub extensions: &'static [&'static str],
}

const BUILTIN_LANGUAGES: &[LanguageTraits] = &[
    LanguageTraits {
        language_id: "rust",
        aliases: &["rs"],
        comment_prefix: "//",
        doc_comment: ("///", ""),
        extensions: &["rs"],
    },
    LanguageTraits {
        language_id: "java",
        aliases: &[],
        comment_prefix: "//",
        doc_comment: ("/**", "*/"),
        extensions: &["java"],
    },
    LanguageTraits {
        language_id: "kotlin",
        aliases: &["kt"],
        comment_prefix: "//",
        doc_comment: ("/**", "*/"),
        extensions: &["kt", "kts"],
    },
    LanguageTraits {
        language_id: "javascript",
        aliases: &["js"],
        comment_prefix: "//",
        doc_comment: ("/**", "*/"),
        extensions: &["js", "mjs", "cjs"],
    },
    LanguageTraits {
        language_id: "typescript",
        aliases: &["ts"],
        comment_prefix: "//",
        doc_comment: ("/**", "*/"),
        extensions: &["ts", "tsx"],
    },
    LanguageTraits {
        language_id: "go",
        aliases: &["golang"],
        comment_prefix: "//",
        doc_comment: ("//", ""),
        extensions: &["go"],
    },
    LanguageTraits {
        language_id: "python",
        aliases: &["py"],
        comment_prefix: "#",
        doc_comment: ("\"\"\"", "\"\"\""),
        extensions: &["py"],
    },
    LanguageTraits {
        language_id: "bash",
        aliases: &["sh", "shell", "zsh"],
        comment_prefix: "#",
        doc_comment: ("#", ""),
        extensions: &["sh", "bash"],
    },
    LanguageTraits {
        language_id: "markdown",
        aliases: &["md"],
        comment_prefix: "<!--",
        doc_comment: ("<!--", "-->"),
        extensions: &["md"],
    },
    LanguageTraits {
        language_id: "shire",
        aliases: &["devin", "devins"],
        comment_prefix: "#",
        doc_comment: ("[", "]"),
        extensions: &["shire", "devin"],
    },
];

/// Capability table built once per [`crate::compiler::Environment`].
#[derive(Debug, Clone)]
pub struct LanguageTable {
    by_id: HashMap<&'static str, LanguageTraits>,
    by_alias: HashMap<&'static str, &'static str>,
    by_extension: HashMap<&'static str, &'static str>,
}

impl Default for LanguageTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LanguageTable {
    pub fn builtin() -> Self {
        let mut table = Self {
            by_id: HashMap::new(),
            by_alias: HashMap::new(),
            by_extension: HashMap::new(),
        };
        for traits in BUILTIN_LANGUAGES {
            table.register(traits.clone());
        }
        table
    }

    pub fn register(&mut self, traits: LanguageTraits) {
        for alias in traits.aliases {
            self.by_alias.insert(*alias, traits.language_id);
        }
        for ext in traits.extensions {
            self.by_extension.insert(*ext, traits.language_id);
        }
        self.by_id.insert(traits.language_id, traits);
    }

    /// Looks up a language id or alias, case-insensitively.
    pub fn get(&self, language_id: &str) -> Option<&LanguageTraits> {
        let id = language_id.to_ascii_lowercase();
        let canonical = self.by_alias.get(id.as_str()).copied().unwrap_or(id.as_str());
        self.by_id.get(canonical)
    }

    pub fn for_path(&self, path: &str) -> Option<&LanguageTraits> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
        let id = self.by_extension.get(ext.to_ascii_lowercase().as_str())?;
        self.by_id.get(*id)
    }

    /// Canonical id for a fence language tag; unknown tags pass through.
    pub fn canonical_id(&self, language_id: &str) -> String {
        self.get(language_id)
            .map(|t| t.language_id.to_string())
            .unwrap_or_else(|| language_id.to_string())
    }

    /// Canonical id plus code with trailing whitespace removed per line.
    pub fn format_code(&self, language_id: Option<&str>, content: &str) -> (Option<String>, String) {
        let id = language_id.map(|id| self.canonical_id(id));
        let mut formatted: String = content
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        if content.ends_with('\n') {
            formatted.push('\n');
        }
        (id, formatted)
    }
}
