//! Precedence-climbing recursive descent over the lexer's token stream.
//!
//! ```text
//! line        := list?
//! list        := andor ( ( ';' | '&' ) andor )*       ';' or '&' may trail
//! andor       := pipeline ( ('&&' | '||') pipeline )*
//! pipeline    := primary  ( ('|' | '|&')   primary   )*
//! primary     := '(' list ')' redirects?
//!              | command    redirects?
//! command     := Word+
//! redirects   := (redir-op Word)+
//! ```

use crate::ast::{AstNode, RedirectKind};
use crate::error::ParseError;
use crate::lexer;
use crate::token::{Token, TokenKind};

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parse one command line. Returns `Ok(None)` for a blank line (or a line
/// that is only a comment), `Ok(Some(ast))` otherwise.
pub fn parse(line: &str) -> Result<Option<AstNode>, ParseError> {
    let tokens = lexer::tokenize(line);
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_line()
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check_error_token(&self) -> Result<(), ParseError> {
        let tok = self.peek();
        if tok.kind == TokenKind::Error {
            return Err(ParseError::UnexpectedToken {
                pos: tok.pos,
                description: tok.text().unwrap_or("lex error").to_string(),
            });
        }
        Ok(())
    }

    /// Skip leading newlines; a line made only of blanks/comments lexes to
    /// `End` immediately and parses to nothing.
    fn parse_line(&mut self) -> Result<Option<AstNode>, ParseError> {
        self.check_error_token()?;
        if matches!(self.peek_kind(), TokenKind::End) {
            return Ok(None);
        }
        if matches!(
            self.peek_kind(),
            TokenKind::AndIf | TokenKind::OrIf | TokenKind::Pipe | TokenKind::PipeBoth
        ) {
            return Err(ParseError::LeadingOperator);
        }
        let node = self.parse_list()?;
        self.check_error_token()?;
        if !matches!(self.peek_kind(), TokenKind::End) {
            let tok = self.peek();
            return Err(ParseError::UnexpectedToken {
                pos: tok.pos,
                description: format!("{:?}", tok.kind),
            });
        }
        Ok(Some(node))
    }

    fn parse_list(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_andor()?;
        loop {
            match self.peek_kind() {
                TokenKind::Semicolon => {
                    self.advance();
                    if self.at_list_end() {
                        return Ok(node); // trailing ';' ignored
                    }
                    let right = self.parse_andor()?;
                    node = AstNode::Sequence {
                        left: Box::new(node),
                        right: Box::new(right),
                    };
                }
                TokenKind::Ampersand => {
                    self.advance();
                    if self.at_list_end() {
                        return Ok(AstNode::Background { inner: Box::new(node) });
                    }
                    let right = self.parse_andor()?;
                    node = AstNode::Sequence {
                        left: Box::new(AstNode::Background { inner: Box::new(node) }),
                        right: Box::new(right),
                    };
                }
                _ => return Ok(node),
            }
        }
    }

    fn at_list_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::End | TokenKind::RParen | TokenKind::Newline)
    }

    fn parse_andor(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_pipeline()?;
        loop {
            match self.peek_kind() {
                TokenKind::AndIf => {
                    self.advance();
                    let right = self.parse_pipeline()?;
                    node = AstNode::And { left: Box::new(node), right: Box::new(right) };
                }
                TokenKind::OrIf => {
                    self.advance();
                    let right = self.parse_pipeline()?;
                    node = AstNode::Or { left: Box::new(node), right: Box::new(right) };
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_pipeline(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_primary()?;
        loop {
            let forward_stderr = match self.peek_kind() {
                TokenKind::Pipe => false,
                TokenKind::PipeBoth => true,
                _ => return Ok(node),
            };
            self.advance();
            let right = self.parse_primary()?;
            node = AstNode::Pipeline {
                left: Box::new(node),
                right: Box::new(right),
                forward_stderr,
            };
        }
    }

    fn parse_primary(&mut self) -> Result<AstNode, ParseError> {
        self.check_error_token()?;
        let node = if matches!(self.peek_kind(), TokenKind::LParen) {
            self.advance();
            let inner = self.parse_list()?;
            self.check_error_token()?;
            if !matches!(self.peek_kind(), TokenKind::RParen) {
                return Err(ParseError::UnclosedSubshell);
            }
            self.advance();
            AstNode::Subshell { inner: Box::new(inner) }
        } else {
            self.parse_command()?
        };
        self.parse_redirects(node)
    }

    fn parse_command(&mut self) -> Result<AstNode, ParseError> {
        let mut words = Vec::new();
        while self.peek_kind() == TokenKind::Word {
            let tok = self.advance();
            words.push(tok.text().unwrap_or_default().to_string());
        }
        if words.is_empty() {
            let tok = self.peek();
            return Err(ParseError::UnexpectedToken {
                pos: tok.pos,
                description: format!("{:?}", tok.kind),
            });
        }
        Ok(AstNode::Command { words })
    }

    fn parse_redirects(&mut self, mut node: AstNode) -> Result<AstNode, ParseError> {
        loop {
            let kind = match self.peek_kind() {
                TokenKind::RedirIn => RedirectKind::In,
                TokenKind::RedirOut => RedirectKind::Out,
                TokenKind::RedirOutAppend => RedirectKind::OutAppend,
                TokenKind::RedirErr => RedirectKind::Err,
                TokenKind::RedirErrAppend => RedirectKind::ErrAppend,
                TokenKind::RedirBoth => RedirectKind::Both,
                TokenKind::RedirBothAppend => RedirectKind::BothAppend,
                _ => return Ok(node),
            };
            self.advance();
            if self.peek_kind() != TokenKind::Word {
                let tok = self.peek();
                return Err(ParseError::MissingRedirectTarget { pos: tok.pos });
            }
            let path = self.advance().text().unwrap_or_default().to_string();
            node = AstNode::Redirect { target: Box::new(node), kind, path };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(line: &str) -> AstNode {
        parse(line).expect("parse should succeed").expect("line should not be empty")
    }

    #[test]
    fn blank_line_parses_to_none() {
        assert!(parse("").unwrap().is_none());
        assert!(parse("   # only a comment").unwrap().is_none());
    }

    #[test]
    fn simple_command() {
        let ast = parse_ok("ls -l /tmp");
        match ast {
            AstNode::Command { words } => assert_eq!(words, vec!["ls", "-l", "/tmp"]),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[test]
    fn pipeline_is_left_associative() {
        let ast = parse_ok("a | b | c");
        match ast {
            AstNode::Pipeline { left, right, forward_stderr } => {
                assert!(!forward_stderr);
                assert!(matches!(*right, AstNode::Command { .. }));
                assert!(matches!(*left, AstNode::Pipeline { .. }));
            }
            other => panic!("expected Pipeline, got {other:?}"),
        }
    }

    #[test]
    fn and_or_precedence_over_sequence() {
        let ast = parse_ok("false || echo x && echo y");
        match ast {
            AstNode::And { left, .. } => {
                assert!(matches!(*left, AstNode::Or { .. }));
            }
            other => panic!("expected outer And, got {other:?}"),
        }
    }

    #[test]
    fn trailing_semicolon_is_ignored() {
        let ast = parse_ok("echo hi ;");
        assert!(matches!(ast, AstNode::Command { .. }));
    }

    #[test]
    fn background_at_end_of_line() {
        let ast = parse_ok("sleep 5 &");
        assert!(matches!(ast, AstNode::Background { .. }));
    }

    #[test]
    fn background_followed_by_command_normalizes_to_sequence() {
        let ast = parse_ok("sleep 5 & echo done");
        match ast {
            AstNode::Sequence { left, right } => {
                assert!(matches!(*left, AstNode::Background { .. }));
                assert!(matches!(*right, AstNode::Command { .. }));
            }
            other => panic!("expected Sequence(Background, _), got {other:?}"),
        }
    }

    #[test]
    fn redirect_chain_last_typed_is_outermost() {
        let ast = parse_ok("cmd > a > b");
        match ast {
            AstNode::Redirect { path, target, .. } => {
                assert_eq!(path, "b");
                assert!(matches!(*target, AstNode::Redirect { .. }));
            }
            other => panic!("expected outer Redirect, got {other:?}"),
        }
    }

    #[test]
    fn combined_redirect_is_a_single_node() {
        let ast = parse_ok("cmd &> out");
        match ast {
            AstNode::Redirect { kind, path, target } => {
                assert_eq!(kind, RedirectKind::Both);
                assert_eq!(path, "out");
                assert!(matches!(*target, AstNode::Command { .. }));
            }
            other => panic!("expected a single Redirect, got {other:?}"),
        }

        let ast = parse_ok("cmd &>> out");
        match ast {
            AstNode::Redirect { kind, .. } => assert_eq!(kind, RedirectKind::BothAppend),
            other => panic!("expected a single Redirect, got {other:?}"),
        }
    }

    #[test]
    fn subshell_group() {
        let ast = parse_ok("(echo a; echo b) > out");
        match ast {
            AstNode::Redirect { target, path, .. } => {
                assert_eq!(path, "out");
                assert!(matches!(*target, AstNode::Subshell { .. }));
            }
            other => panic!("expected Redirect(Subshell), got {other:?}"),
        }
    }

    #[test]
    fn leading_operator_is_error() {
        assert!(parse("| echo hi").is_err());
        assert!(parse("&& echo hi").is_err());
    }

    #[test]
    fn missing_redirect_target_is_error() {
        assert!(parse("echo hi >").is_err());
    }

    #[test]
    fn unclosed_subshell_is_error() {
        assert!(parse("(echo hi").is_err());
    }
}
