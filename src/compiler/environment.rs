use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use lazy_static::lazy_static;

use crate::command::{CommandHandler, CommandRegistry, DefaultShellSafetyChecker, ShellSafetyChecker};
use crate::config::CompilerConfig;
use crate::language::LanguageTable;
use crate::source::{FileSystemSourceResolver, SourceResolver};
use crate::variable::{ResolverRegistry, Value, VariableResolver};

lazy_static! {
    static ref SHARED_ENVIRONMENT: Arc<Environment> = Arc::new(Environment::default());
}

/// Everything a compilation run may use besides its own document.
///
/// Runs never mutate the environment; build a separate one to override a
/// collaborator.
#[derive(Clone)]
pub struct Environment {
    pub config: Arc<CompilerConfig>,
    pub resolvers: ResolverRegistry,
    pub commands: CommandRegistry,
    pub safety: Arc<dyn ShellSafetyChecker>,
    pub source: Arc<dyn SourceResolver>,
    pub languages: Arc<LanguageTable>,
    /// Agents known besides those declared in a script's front-matter.
    pub agents: BTreeSet<String>,
    /// Inserted with system scope into every run.
    pub system_variables: HashMap<String, Value>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            config: Arc::new(CompilerConfig::default()),
            resolvers: ResolverRegistry::with_builtins(),
            commands: CommandRegistry::with_builtins(),
            safety: Arc::new(DefaultShellSafetyChecker),
            source: Arc::new(FileSystemSourceResolver::new()),
            languages: Arc::new(LanguageTable::builtin()),
            agents: BTreeSet::new(),
            system_variables: HashMap::new(),
        }
    }
}

impl Environment {
    /// Process-wide defaults, built on first use.
    pub fn shared() -> Arc<Environment> {
        SHARED_ENVIRONMENT.clone()
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_safety_checker(mut self, checker: Arc<dyn ShellSafetyChecker>) -> Self {
        self.safety = checker;
        self
    }

    pub fn with_source_resolver(mut self, source: Arc<dyn SourceResolver>) -> Self {
        self.source = source;
        self
    }

    pub fn with_command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.register(handler);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn VariableResolver>) -> Self {
        self.resolvers.register(resolver);
        self
    }

    pub fn with_agent(mut self, name: impl Into<String>) -> Self {
        self.agents.insert(name.into());
        self
    }

    pub fn with_system_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.system_variables.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_environment_is_built_once() {
        let a = Environment::shared();
        let b = Environment::shared();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.commands.get("file").is_some());
        assert!(a.resolvers.lookup("grep").is_some());
    }

    #[test]
    fn test_builder_overrides() {
        let env = Environment::default()
            .with_agent("reviewer")
            .with_system_variable("user", Value::text("ada"))
            .with_config(CompilerConfig {
                allow_undeclared_agents: false,
                ..Default::default()
            });
        assert!(env.agents.contains("reviewer"));
        assert!(!env.config.allow_undeclared_agents);
        assert_eq!(env.system_variables.get("user"), Some(&Value::text("ada")));
    }
}
