// src/core/protocol/line.rs

//! Implements the command-line structure of the bridge protocol and the
//! `Decoder`/`Encoder` pair used on client connections.
//!
//! A command is a single newline-terminated line of the form
//! `DOMAIN [OPCODE] [KEY=VALUE ...]`. Values may be double-quoted to carry
//! spaces, with `\"` and `\\` as the only escapes.

use super::props::Props;
use super::reply::Reply;
use crate::core::SamError;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single command line, newline excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Upper-cased first token, e.g. `SESSION`.
    pub domain: String,
    /// Upper-cased second token when it is not a property, e.g. `CREATE`.
    pub opcode: Option<String>,
    pub props: Props,
    /// Everything after the domain token, untouched. `PING`/`PONG` echo this.
    pub rest: String,
}

impl CommandLine {
    /// Tokenizes one line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, SamError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(SamError::Malformed("empty line".to_string()));
        }

        let (domain, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((d, r)) => (d, r.trim_start()),
            None => (trimmed, ""),
        };

        let mut tokens = tokenize(rest)?.into_iter().peekable();
        let opcode = match tokens.peek() {
            Some(first) if !first.contains('=') => tokens.next().map(|t| t.to_ascii_uppercase()),
            _ => None,
        };

        let mut props = Props::new();
        for token in tokens {
            match token.split_once('=') {
                Some((k, v)) if !k.is_empty() => props.insert(k, v),
                Some(_) => return Err(SamError::Malformed(format!("bad property '{token}'"))),
                None => props.insert(token, ""),
            }
        }

        Ok(Self {
            domain: domain.to_ascii_uppercase(),
            opcode,
            props,
            rest: rest.to_string(),
        })
    }

    /// `DOMAIN OPCODE`, used in log lines and error messages.
    pub fn name(&self) -> String {
        match &self.opcode {
            Some(op) => format!("{} {}", self.domain, op),
            None => self.domain.clone(),
        }
    }
}

/// Splits on unquoted whitespace, unwrapping quoted sections.
fn tokenize(input: &str) -> Result<Vec<String>, SamError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(SamError::Malformed("dangling escape".to_string())),
            },
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if in_quotes {
        return Err(SamError::Malformed("unterminated quote".to_string()));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// A `tokio_util::codec` implementation for bridge command lines.
#[derive(Debug, Default)]
pub struct SamCodec;

impl Decoder for SamCodec {
    type Item = CommandLine;
    type Error = SamError;

    /// Yields the next non-blank line. `\r\n` terminators are tolerated.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(SamError::LineTooLong(MAX_LINE_LENGTH));
                }
                return Ok(None);
            };
            if pos > MAX_LINE_LENGTH {
                return Err(SamError::LineTooLong(MAX_LINE_LENGTH));
            }

            let raw = src.split_to(pos + 1);
            let text = std::str::from_utf8(&raw[..pos])?;
            let text = text.strip_suffix('\r').unwrap_or(text);
            if text.trim().is_empty() {
                continue;
            }
            return CommandLine::parse(text).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // An unterminated final line is still a command.
        let raw = src.split_to(src.len());
        let text = std::str::from_utf8(&raw)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        CommandLine::parse(text.trim_end_matches('\r')).map(Some)
    }
}

impl Encoder<Reply> for SamCodec {
    type Error = SamError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.to_line().as_bytes());
        Ok(())
    }
}
