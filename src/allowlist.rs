use thiserror::Error;

/// Programs a session is permitted to run.
///
/// Only the program name is checked. Arguments pass through untouched, so
/// `rm -rf <anything>` is accepted because `rm` is listed here. Nothing on
/// this list may execute an arbitrary command line (no shells, no `env`).
pub const ALLOWED_PROGRAMS: &[&str] = &[
    // package managers and build tools
    "npm", "npx", "pnpm", "yarn", "bun", "pip", "pip3", "cargo", "make", "go",
    // version control
    "git",
    // file utilities
    "ls", "cat", "echo", "pwd", "mkdir", "rm", "cp", "mv", "touch", "head", "tail",
    "grep", "find", "wc", "sleep", "printf", "which", "printenv",
    // interpreters and compilers
    "node", "deno", "python", "python3", "ruby", "php", "rustc", "gcc", "g++",
    "java", "javac", "tsc",
];

/// Package managers whose script runners host long-lived dev servers.
const STREAMING_PROGRAMS: &[&str] = &["npm", "pnpm", "yarn", "bun"];

/// Script names that start a process meant to stay alive.
const STREAMING_SCRIPTS: &[&str] = &["dev", "start", "serve", "preview"];

/// Exit indicator reported to callers when a command is rejected before spawn.
pub const REJECTED_EXIT_CODE: i32 = 126;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty command")]
    Empty,

    #[error("command '{program}' is not allowed. Allowed commands: {allowed}")]
    NotAllowed { program: String, allowed: String },
}

impl ValidationError {
    fn not_allowed(program: &str) -> Self {
        ValidationError::NotAllowed {
            program: program.to_string(),
            allowed: ALLOWED_PROGRAMS.join(", "),
        }
    }
}

/// A command line split into a program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// Tokenize and validate a raw command line.
    ///
    /// Tokens are separated by whitespace with no quoting or escaping, so
    /// `echo "a b"` yields the arguments `"a` and `b"`.
    pub fn parse(line: &str) -> Result<Self, ValidationError> {
        let mut tokens = line.split_whitespace();
        let program = tokens.next().ok_or(ValidationError::Empty)?;

        // A path would let `/tmp/evil/ls` masquerade as `ls`.
        if program.contains('/') || !is_allowed(program) {
            return Err(ValidationError::not_allowed(program));
        }

        Ok(Self {
            program: program.to_string(),
            args: tokens.map(str::to_string).collect(),
        })
    }

    /// Whether this command starts a dev server that should be streamed
    /// rather than awaited.
    ///
    /// Matches `<pm> run <script>` and the `<pm> <script>` shorthand, where
    /// `<pm>` is a JavaScript package manager and `<script>` is one of the
    /// conventional long-running script names.
    pub fn is_streaming(&self) -> bool {
        if !STREAMING_PROGRAMS.contains(&self.program.as_str()) {
            return false;
        }
        let script = match self.args.first().map(String::as_str) {
            Some("run") | Some("run-script") => self.args.get(1).map(String::as_str),
            other => other,
        };
        script.is_some_and(|s| STREAMING_SCRIPTS.contains(&s))
    }

    /// The command as it will be reported in logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Check a bare program name against [`ALLOWED_PROGRAMS`].
pub fn is_allowed(program: &str) -> bool {
    ALLOWED_PROGRAMS.contains(&program)
}
