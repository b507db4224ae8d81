//! Typed error kinds for each subsystem, following the one-enum-per-subsystem
//! shape used by real Rust shells (e.g. ion's `PipelineError`/`RedirectError`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unclosed quote at byte {pos}")]
    UnclosedQuote { pos: usize },
    #[error("dangling backslash at byte {pos}")]
    DanglingBackslash { pos: usize },
    #[error("malformed '&' at byte {pos}")]
    MalformedAmpersand { pos: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected token at byte {pos}: {description}")]
    UnexpectedToken { pos: usize, description: String },
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("expected filename after redirect at byte {pos}")]
    MissingRedirectTarget { pos: usize },
    #[error("missing ')' to close subshell")]
    UnclosedSubshell,
    #[error("command starts with a binary operator")]
    LeadingOperator,
    #[error("empty command")]
    EmptyCommand,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),
    #[error("pipe creation failed: {0}")]
    Pipe(#[source] std::io::Error),
    #[error("{path}: {source}")]
    RedirectOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program}: command not found")]
    CommandNotFound { program: String },
    #[error("wait failed: {0}")]
    Wait(#[source] nix::Error),
    #[error("unknown AST kind encountered during execution")]
    UnknownNode,
}

#[derive(Debug, Error)]
pub enum JobControlError {
    #[error("no such job: {0}")]
    UnknownJob(String),
    #[error("job {0} is not stopped")]
    NotStopped(i32),
    #[error("missing argument")]
    MissingArgument,
    #[error("{0}: no such signal")]
    UnknownSignal(String),
    #[error("terminal control failed: {0}")]
    Terminal(#[source] nix::Error),
}
