//! The tagged tree produced by the parser and walked by the executor.

use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    In,
    Out,
    OutAppend,
    Err,
    ErrAppend,
    /// `&>`: stdout and stderr share a single opened file description.
    Both,
    /// `&>>`: like `Both`, opened in append mode.
    BothAppend,
}

impl RedirectKind {
    fn operator(self) -> &'static str {
        match self {
            RedirectKind::In => "<",
            RedirectKind::Out => ">",
            RedirectKind::OutAppend => ">>",
            RedirectKind::Err => "2>",
            RedirectKind::ErrAppend => "2>>",
            RedirectKind::Both => "&>",
            RedirectKind::BothAppend => "&>>",
        }
    }
}

/// A parsed command line. `Redirect` wraps whatever node it applies to;
/// the outermost `Redirect` in a chain is the one typed last (see the
/// parser's redirect-chain construction).
#[derive(Debug, Clone)]
pub enum AstNode {
    Command {
        words: Vec<String>,
    },
    Pipeline {
        left: Box<AstNode>,
        right: Box<AstNode>,
        forward_stderr: bool,
    },
    Sequence {
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    And {
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Or {
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Background {
        inner: Box<AstNode>,
    },
    Subshell {
        inner: Box<AstNode>,
    },
    Redirect {
        target: Box<AstNode>,
        kind: RedirectKind,
        path: String,
    },
}

impl AstNode {
    /// Deterministically render the node back to a command string, the way
    /// job listings and `bg`/`fg` echo the job's command text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            AstNode::Command { words } => {
                let _ = write!(out, "{}", words.join(" "));
            }
            AstNode::Pipeline { left, right, forward_stderr } => {
                left.render_into(out);
                out.push_str(if *forward_stderr { " |& " } else { " | " });
                right.render_into(out);
            }
            AstNode::Sequence { left, right } => {
                left.render_into(out);
                out.push_str("; ");
                right.render_into(out);
            }
            AstNode::And { left, right } => {
                left.render_into(out);
                out.push_str(" && ");
                right.render_into(out);
            }
            AstNode::Or { left, right } => {
                left.render_into(out);
                out.push_str(" || ");
                right.render_into(out);
            }
            AstNode::Background { inner } => {
                inner.render_into(out);
                out.push_str(" &");
            }
            AstNode::Subshell { inner } => {
                out.push('(');
                inner.render_into(out);
                out.push(')');
            }
            AstNode::Redirect { target, kind, path } => {
                target.render_into(out);
                let _ = write!(out, " {} {}", kind.operator(), path);
            }
        }
    }
}
