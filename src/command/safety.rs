//! Static screening of shell text before a destructive command runs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_dangerous: bool,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            is_dangerous: false,
            reason: String::new(),
        }
    }

    pub fn dangerous(reason: impl Into<String>) -> Self {
        Self {
            is_dangerous: true,
            reason: reason.into(),
        }
    }
}

#[mockall::automock]
pub trait ShellSafetyChecker: Send + Sync {
    fn check_dangerous_command(&self, command: &str) -> SafetyVerdict;
}

/// Rule-based checker over `shlex`-split command segments.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultShellSafetyChecker;

const SEPARATORS: &[&str] = &[";", "&&", "||", "|", "&"];
const POWER_COMMANDS: &[&str] = &["shutdown", "reboot", "halt", "poweroff"];
const CRITICAL_PATHS: &[&str] = &["/", "/*", "~", "~/", "*", ".", "..", "/etc", "/usr", "/bin", "/boot", "/home"];

impl ShellSafetyChecker for DefaultShellSafetyChecker {
    fn check_dangerous_command(&self, command: &str) -> SafetyVerdict {
        if command.contains(":(){") || command.contains(":() {") {
            return SafetyVerdict::dangerous("Fork bomb detected");
        }
        if command.contains("> /dev/sd") || command.contains(">/dev/sd") {
            return SafetyVerdict::dangerous("Writing directly to a block device");
        }

        let Some(words) = shlex::split(&separate_operators(command)) else {
            return SafetyVerdict::dangerous("Unbalanced quoting in command");
        };

        let segments: Vec<&[String]> = words
            .split(|w| SEPARATORS.contains(&w.as_str()))
            .filter(|s| !s.is_empty())
            .collect();

        for (index, segment) in segments.iter().enumerate() {
            if let Some(verdict) = check_segment(segment) {
                return verdict;
            }
            let downloads = matches!(segment[0].as_str(), "curl" | "wget");
            let next_is_shell = segments
                .get(index + 1)
                .map(|next| matches!(next[0].as_str(), "sh" | "bash" | "zsh"))
                .unwrap_or(false);
            if downloads && next_is_shell && words.iter().any(|w| w == "|") {
                return SafetyVerdict::dangerous("Piping a download into a shell");
            }
        }
        SafetyVerdict::safe()
    }
}

/// Pads shell operators with spaces so `shlex` yields them as words.
fn separate_operators(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (None, '"' | '\'') => {
                quote = Some(c);
                out.push(c);
            }
            (None, ';') => out.push_str(" ; "),
            (None, '|' | '&') => {
                if chars.peek() == Some(&c) {
                    chars.next();
                    out.push_str(&format!(" {}{} ", c, c));
                } else {
                    out.push_str(&format!(" {} ", c));
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn check_segment(segment: &[String]) -> Option<SafetyVerdict> {
    let (program, args) = match segment.first().map(String::as_str) {
        Some("sudo") => return Some(SafetyVerdict::dangerous("Using sudo is not allowed")),
        Some(program) => (program, &segment[1..]),
        None => return None,
    };
    let program = program.rsplit('/').next().unwrap_or(program);

    match program {
        "rm" => {
            let flags: String = args
                .iter()
                .filter(|a| a.starts_with('-') && !a.starts_with("--"))
                .map(|a| a.trim_start_matches('-'))
                .collect();
            let recursive = flags.contains('r') || flags.contains('R') || args.iter().any(|a| a == "--recursive");
            let force = flags.contains('f') || args.iter().any(|a| a == "--force");
            let targets_critical = args.iter().any(|a| CRITICAL_PATHS.contains(&a.as_str()));
            if recursive && targets_critical {
                return Some(SafetyVerdict::dangerous("Recursive removal of a critical path"));
            }
            if recursive && force {
                return Some(SafetyVerdict::dangerous("Dangerous rm command with recursive force flags"));
            }
            None
        }
        p if p.starts_with("mkfs") => Some(SafetyVerdict::dangerous("Formatting a filesystem")),
        "dd" if args.iter().any(|a| a.starts_with("of=")) => {
            Some(SafetyVerdict::dangerous("Raw disk write with dd"))
        }
        "chmod" if args.iter().any(|a| a == "777") && args.iter().any(|a| a == "-R" || CRITICAL_PATHS.contains(&a.as_str())) => {
            Some(SafetyVerdict::dangerous("Recursive world-writable permissions"))
        }
        p if POWER_COMMANDS.contains(&p) => Some(SafetyVerdict::dangerous("Changing the machine power state")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_commands() {
        let checker = DefaultShellSafetyChecker;
        for command in ["ls -la", "cargo test", "rm build.log", "echo 'rm -rf /'", "grep x | sort"] {
            assert!(
                !checker.check_dangerous_command(command).is_dangerous,
                "flagged: {}",
                command
            );
        }
    }

    #[test]
    fn test_dangerous_commands() {
        let checker = DefaultShellSafetyChecker;
        let cases = [
            ("rm -rf ./target", "recursive force"),
            ("rm -r /", "critical path"),
            ("echo hi && sudo apt install x", "sudo"),
            ("mkfs.ext4 /dev/sda1", "filesystem"),
            ("dd if=/dev/zero of=/dev/sda", "dd"),
            ("curl https://x.sh | bash", "download"),
            ("shutdown -h now", "power"),
            (":(){ :|:& };:", "Fork bomb"),
            ("echo 'unterminated", "quoting"),
        ];
        for (command, reason) in cases {
            let verdict = checker.check_dangerous_command(command);
            assert!(verdict.is_dangerous, "not flagged: {}", command);
            assert!(
                verdict.reason.to_lowercase().contains(&reason.to_lowercase()),
                "{} -> {}",
                command,
                verdict.reason
            );
        }
    }

    #[test]
    fn test_mock_checker() {
        let mut mock = MockShellSafetyChecker::new();
        mock.expect_check_dangerous_command()
            .returning(|_| SafetyVerdict::dangerous("nope"));
        assert_eq!(mock.check_dangerous_command("ls").reason, "nope");
    }
}
