//! REXX lexer: tokenizes source text into a stream of tokens.
//!
//! The language has no reserved words (keywords are context-sensitive), so
//! the lexer produces generic symbols and lets the parser decide meaning.
//! Symbols are upper-cased here, once, so later stages never compare
//! case-insensitively.
//!
//! Beyond classic REXX the lexer handles:
//! - `|>` pipe tokens, and continuation onto a following line that starts
//!   with `|>`;
//! - `<<TAG` HEREDOC blocks, captured verbatim as one string token;
//! - `[ ]` and `{ }` for array/object literals (newlines inside them do
//!   not end the clause).

use crate::error::{RexxDiagnostic, RexxError, RexxResult, SourceLoc};

/// Token types produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    StringLit(String),
    Number(String),
    Symbol(String),
    /// Raw text captured from a `<<TAG ... TAG` block.
    Heredoc(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    IntDiv,    // %
    Remainder, // //
    Power,     // **
    Concat,    // ||
    Pipe,      // |>
    Assign,    // = (the parser decides between assignment and comparison)

    // Comparison
    NotEqual,    // \= or <>
    Greater,     // >
    Less,        // <
    GreaterEq,   // >= or \<
    LessEq,      // <= or \>
    StrictEq,    // ==
    StrictNotEq, // \==
    StrictGt,    // >>
    StrictLt,    // <<
    StrictGte,   // >>=
    StrictLte,   // <<=

    // Logical
    And, // &
    Or,  // |
    Xor, // &&
    Not, // \ or ¬

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Semicolon,
    Colon,
    Dot,

    // Special
    Eol, // End of logical line (clause terminator)
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: SourceLoc,
    /// Whether whitespace (or a comment) appeared before this token.
    /// Used by the parser to distinguish abuttal from blank concatenation,
    /// and function calls (`name(`) from concat-with-parens (`name (`).
    pub space_before: bool,
    /// Source spelling of a symbol, before upper-casing.
    pub spelling: Option<String>,
}

impl Token {
    pub fn new(kind: TokenKind, loc: SourceLoc, space_before: bool) -> Self {
        Self {
            kind,
            loc,
            space_before,
            spelling: None,
        }
    }
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    lines: Vec<String>,
    /// Open `[`/`{` count; newlines inside literals are not clause ends.
    nesting: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        let lines: Vec<String> = source.lines().map(String::from).collect();
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            lines,
            nesting: 0,
        }
    }

    pub fn tokenize(&mut self) -> RexxResult<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            let pos_before = self.pos;
            self.skip_whitespace_and_comments()?;
            let had_space = self.pos > pos_before;

            if self.at_end() {
                tokens.push(Token::new(TokenKind::Eof, self.loc(), had_space));
                break;
            }

            if self.peek() == Some('\n') && (self.nesting > 0 || self.next_line_is_pipe_stage()) {
                self.skip_to_pipe_stage();
                continue;
            }

            let mut token = self.next_token()?;
            token.space_before = had_space;

            // Line continuation: if token is a comma and the rest of the
            // line (ignoring whitespace/comments) is empty, this comma is a
            // continuation marker: skip it and join with the next line.
            if matches!(token.kind, TokenKind::Comma)
                && self.nesting == 0
                && self.is_line_continuation()
            {
                while let Some(ch) = self.peek() {
                    if ch == '\n' {
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            tokens.push(token);
        }

        if self.nesting > 0 {
            return Err(RexxDiagnostic::new(RexxError::IncompleteBlock)
                .at(self.loc())
                .with_detail("unclosed '[' or '{' at end of source"));
        }

        Ok(tokens)
    }

    fn loc(&self) -> SourceLoc {
        let mut loc = SourceLoc::new(self.line, self.col);
        if self.line > 0 && self.line <= self.lines.len() {
            loc = loc.with_source(self.lines[self.line - 1].clone());
        }
        loc
    }

    /// Check if the rest of the current line (ignoring whitespace and block
    /// comments) is empty: i.e., the next non-blank content is a newline or EOF.
    /// Used to detect trailing-comma line continuation.
    fn is_line_continuation(&self) -> bool {
        let mut i = self.pos;
        while i < self.source.len() {
            let ch = self.source[i];
            match ch {
                ' ' | '\t' | '\r' => {
                    i += 1;
                }
                '\n' => return true,
                // Block comment: skip it entirely
                '/' if i + 1 < self.source.len() && self.source[i + 1] == '*' => {
                    i += 2;
                    let mut depth = 1u32;
                    while depth > 0 && i < self.source.len() {
                        if i + 1 < self.source.len()
                            && self.source[i] == '/'
                            && self.source[i + 1] == '*'
                        {
                            depth += 1;
                            i += 2;
                        } else if i + 1 < self.source.len()
                            && self.source[i] == '*'
                            && self.source[i + 1] == '/'
                        {
                            depth -= 1;
                            i += 2;
                        } else {
                            i += 1;
                        }
                    }
                }
                // Line comment: rest of line is a comment → continuation
                '-' if i + 1 < self.source.len() && self.source[i + 1] == '-' => return true,
                _ => return false,
            }
        }
        // Reached EOF: treat as continuation (no more lines, comma at end of file)
        true
    }

    /// At a newline: does the next non-blank line begin with `|>`?
    fn next_line_is_pipe_stage(&self) -> bool {
        let mut i = self.pos;
        while let Some(&ch) = self.source.get(i) {
            if matches!(ch, ' ' | '\t' | '\r' | '\n') {
                i += 1;
            } else {
                return ch == '|' && self.source.get(i + 1) == Some(&'>');
            }
        }
        false
    }

    /// Consume the newline and any blank lines that follow it.
    fn skip_to_pipe_stage(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\r' | '\n')) {
            self.advance();
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.source.get(self.pos + n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> RexxResult<()> {
        // Skip shebang line if at start of file
        if self.pos == 0 && self.peek() == Some('#') && self.peek_ahead(1) == Some('!') {
            while let Some(ch) = self.peek() {
                if ch == '\n' {
                    break;
                }
                self.advance();
            }
        }

        loop {
            // Skip whitespace but NOT newlines: they are clause terminators
            while let Some(ch) = self.peek() {
                if ch == ' ' || ch == '\t' || ch == '\r' {
                    self.advance();
                } else {
                    break;
                }
            }

            // Skip block comments /* ... */ (can nest)
            if self.peek() == Some('/') && self.peek_ahead(1) == Some('*') {
                let loc = self.loc();
                self.advance(); // /
                self.advance(); // *
                let mut depth = 1u32;
                while depth > 0 {
                    if self.at_end() {
                        return Err(RexxDiagnostic::new(RexxError::UnmatchedComment)
                            .at(loc)
                            .with_detail("unterminated block comment"));
                    }
                    if self.peek() == Some('/') && self.peek_ahead(1) == Some('*') {
                        self.advance();
                        self.advance();
                        depth += 1;
                    } else if self.peek() == Some('*') && self.peek_ahead(1) == Some('/') {
                        self.advance();
                        self.advance();
                        depth -= 1;
                    } else {
                        self.advance();
                    }
                }
                continue;
            }

            // Skip line comments --
            if self.peek() == Some('-') && self.peek_ahead(1) == Some('-') {
                while let Some(ch) = self.peek() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            break;
        }
        Ok(())
    }

    /// Produce a token whose kind needs no further scanning.
    fn single(&mut self, kind: TokenKind, width: usize) -> Token {
        let loc = self.loc();
        for _ in 0..width {
            self.advance();
        }
        Token::new(kind, loc, false)
    }

    #[allow(clippy::too_many_lines)]
    fn next_token(&mut self) -> RexxResult<Token> {
        let loc = self.loc();
        let Some(ch) = self.peek() else {
            return Ok(Token::new(TokenKind::Eof, loc, false));
        };
        let next = self.peek_ahead(1);
        let third = self.peek_ahead(2);

        let token = match ch {
            // String literals: 'single' or "double" quoted
            '\'' | '"' => return self.lex_string(ch),

            // Numbers
            '0'..='9' => self.lex_number(),

            // Symbols (identifiers, keywords: REXX has no reserved words)
            'a'..='z' | 'A'..='Z' | '_' | '!' | '?' | '@' | '#' | '$' => self.lex_symbol(),

            // Dot can start a symbol or be standalone
            '.' => {
                if next.is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    self.lex_symbol()
                } else {
                    self.single(TokenKind::Dot, 1)
                }
            }

            '+' => self.single(TokenKind::Plus, 1),
            '-' => self.single(TokenKind::Minus, 1),
            '*' if next == Some('*') => self.single(TokenKind::Power, 2),
            '*' => self.single(TokenKind::Star, 1),
            '/' if next == Some('/') => self.single(TokenKind::Remainder, 2),
            '/' => self.single(TokenKind::Slash, 1),
            '%' => self.single(TokenKind::IntDiv, 1),
            '|' if next == Some('|') => self.single(TokenKind::Concat, 2),
            '|' if next == Some('>') => self.single(TokenKind::Pipe, 2),
            '|' => self.single(TokenKind::Or, 1),
            '&' if next == Some('&') => self.single(TokenKind::Xor, 2),
            '&' => self.single(TokenKind::And, 1),
            '\\' | '¬' => match (next, third) {
                (Some('='), Some('=')) => self.single(TokenKind::StrictNotEq, 3),
                (Some('='), _) => self.single(TokenKind::NotEqual, 2),
                (Some('<'), _) => self.single(TokenKind::GreaterEq, 2),
                (Some('>'), _) => self.single(TokenKind::LessEq, 2),
                _ => self.single(TokenKind::Not, 1),
            },
            '=' if next == Some('=') => self.single(TokenKind::StrictEq, 2),
            '=' => self.single(TokenKind::Assign, 1),
            '>' => match (next, third) {
                (Some('>'), Some('=')) => self.single(TokenKind::StrictGte, 3),
                (Some('>'), _) => self.single(TokenKind::StrictGt, 2),
                (Some('='), _) => self.single(TokenKind::GreaterEq, 2),
                _ => self.single(TokenKind::Greater, 1),
            },
            '<' => {
                if let Some(tag) = self.heredoc_tag() {
                    return self.lex_heredoc(&tag);
                }
                match (next, third) {
                    (Some('<'), Some('=')) => self.single(TokenKind::StrictLte, 3),
                    (Some('<'), _) => self.single(TokenKind::StrictLt, 2),
                    (Some('='), _) => self.single(TokenKind::LessEq, 2),
                    (Some('>'), _) => self.single(TokenKind::NotEqual, 2),
                    _ => self.single(TokenKind::Less, 1),
                }
            }
            '(' => self.single(TokenKind::LeftParen, 1),
            ')' => self.single(TokenKind::RightParen, 1),
            '[' => {
                self.nesting += 1;
                self.single(TokenKind::LeftBracket, 1)
            }
            ']' => {
                self.nesting = self.nesting.saturating_sub(1);
                self.single(TokenKind::RightBracket, 1)
            }
            '{' => {
                self.nesting += 1;
                self.single(TokenKind::LeftBrace, 1)
            }
            '}' => {
                self.nesting = self.nesting.saturating_sub(1);
                self.single(TokenKind::RightBrace, 1)
            }
            ',' => self.single(TokenKind::Comma, 1),
            '\n' => self.single(TokenKind::Eol, 1),
            ';' => self.single(TokenKind::Semicolon, 1),
            ':' => self.single(TokenKind::Colon, 1),
            _ => {
                return Err(RexxDiagnostic::new(RexxError::InvalidCharacter)
                    .at(loc)
                    .with_detail(format!("unexpected character '{ch}'")));
            }
        };
        Ok(token)
    }

    fn lex_string(&mut self, quote: char) -> RexxResult<Token> {
        let loc = self.loc();
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            let Some(ch) = self.advance() else {
                return Err(RexxDiagnostic::new(RexxError::UnmatchedComment)
                    .at(loc)
                    .with_detail("unterminated string literal"));
            };
            if ch == quote {
                // Doubled quote is an escape: '' inside '...' means literal '
                if self.peek() == Some(quote) {
                    self.advance();
                    value.push(quote);
                } else {
                    break;
                }
            } else {
                value.push(ch);
            }
        }

        // Hex/binary suffix only when the X/B is not the start of a longer symbol.
        let suffix_ends_token = !self
            .peek_ahead(1)
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if let Some(suffix) = self.peek().filter(|_| suffix_ends_token) {
            match suffix.to_ascii_uppercase() {
                'X' => {
                    self.advance();
                    let decoded = hex_string_to_chars(&value).map_err(|e| {
                        RexxDiagnostic::new(RexxError::InvalidHexBinary)
                            .at(loc.clone())
                            .with_detail(e)
                    })?;
                    return Ok(Token::new(TokenKind::StringLit(decoded), loc, false));
                }
                'B' => {
                    self.advance();
                    let decoded = bin_string_to_chars(&value).map_err(|e| {
                        RexxDiagnostic::new(RexxError::InvalidHexBinary)
                            .at(loc.clone())
                            .with_detail(e)
                    })?;
                    return Ok(Token::new(TokenKind::StringLit(decoded), loc, false));
                }
                _ => {}
            }
        }

        Ok(Token::new(TokenKind::StringLit(value), loc, false))
    }

    /// `<<TAG` followed by nothing but blanks up to the end of the line.
    fn heredoc_tag(&self) -> Option<String> {
        if self.peek_ahead(1) != Some('<') {
            return None;
        }
        let first = self.peek_ahead(2)?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        let mut i = self.pos + 2;
        let mut tag = String::new();
        while let Some(&c) = self.source.get(i) {
            if c.is_ascii_alphanumeric() || c == '_' {
                tag.push(c);
                i += 1;
            } else {
                break;
            }
        }
        while let Some(&c) = self.source.get(i) {
            match c {
                ' ' | '\t' | '\r' => i += 1,
                '\n' => return Some(tag),
                _ => return None,
            }
        }
        // `<<TAG` on the last line can never be closed; let lex_heredoc report it.
        Some(tag)
    }

    /// Capture raw lines until one exactly equal to `tag`; only a trailing
    /// carriage return is ignored. The closing line's newline is left for
    /// the clause terminator.
    fn lex_heredoc(&mut self, tag: &str) -> RexxResult<Token> {
        let loc = self.loc();
        while let Some(ch) = self.advance() {
            if ch == '\n' {
                break;
            }
        }

        let mut captured: Vec<String> = Vec::new();
        loop {
            if self.at_end() {
                return Err(RexxDiagnostic::new(RexxError::UnmatchedComment)
                    .at(loc)
                    .with_detail(format!("unterminated HEREDOC <<{tag}")));
            }
            let mut line = String::new();
            while let Some(ch) = self.peek() {
                if ch == '\n' {
                    break;
                }
                line.push(ch);
                self.advance();
            }
            if line.strip_suffix('\r').unwrap_or(&line) == tag {
                break;
            }
            captured.push(line);
            // Consume the newline ending a body line.
            self.advance();
        }

        Ok(Token::new(TokenKind::Heredoc(captured.join("\n")), loc, false))
    }

    fn lex_number(&mut self) -> Token {
        let loc = self.loc();
        let mut num = String::new();

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() || ch == '.' {
                num.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        // Exponent part
        if self.peek().is_some_and(|c| c == 'e' || c == 'E')
            && self
                .peek_ahead(1)
                .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
        {
            if let Some(e) = self.advance() {
                num.push(e);
            }
            if self.peek().is_some_and(|c| c == '+' || c == '-')
                && let Some(sign) = self.advance()
            {
                num.push(sign);
            }
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    num.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        Token::new(TokenKind::Number(num), loc, false)
    }

    fn lex_symbol(&mut self) -> Token {
        let loc = self.loc();
        let mut name = String::new();

        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || matches!(ch, '_' | '.' | '!' | '?' | '@' | '#' | '$') {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let mut token = Token::new(TokenKind::Symbol(name.to_uppercase()), loc, false);
        token.spelling = Some(name);
        token
    }
}

/// Convert a hex string like "48 65 6C" to characters.
fn hex_string_to_chars(s: &str) -> Result<String, String> {
    let hex: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !hex.len().is_multiple_of(2) {
        return Err("odd number of hex digits".into());
    }
    let mut result = String::new();
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| format!("invalid hex digit at position {i}"))?;
        result.push(byte as char);
    }
    Ok(result)
}

/// Convert a binary string like "0100 1000" to characters.
fn bin_string_to_chars(s: &str) -> Result<String, String> {
    let bits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if !bits.len().is_multiple_of(8) {
        return Err("binary string length must be a multiple of 8".into());
    }
    let mut result = String::new();
    for i in (0..bits.len()).step_by(8) {
        let byte = u8::from_str_radix(&bits[i..i + 8], 2)
            .map_err(|_| format!("invalid binary digit at position {i}"))?;
        result.push(byte as char);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn symbols_are_uppercased_once() {
        let tokens = kinds("say Hello");
        assert_eq!(tokens[0], TokenKind::Symbol("SAY".into()));
        assert_eq!(tokens[1], TokenKind::Symbol("HELLO".into()));
    }

    #[test]
    fn strings_keep_their_case() {
        let tokens = kinds("say 'Hello, World!'");
        assert_eq!(tokens[1], TokenKind::StringLit("Hello, World!".into()));
    }

    #[test]
    fn pipe_vs_concat_vs_or() {
        let tokens = kinds("a |> b || c | d");
        assert_eq!(tokens[1], TokenKind::Pipe);
        assert_eq!(tokens[3], TokenKind::Concat);
        assert_eq!(tokens[5], TokenKind::Or);
    }

    #[test]
    fn pipe_inside_string_is_text() {
        let tokens = kinds("say \"arrow |> here\"");
        assert_eq!(tokens[1], TokenKind::StringLit("arrow |> here".into()));
        assert!(!tokens.contains(&TokenKind::Pipe));
    }

    #[test]
    fn next_line_pipe_continues_statement() {
        let tokens = kinds("x = 'a'\n\n   |> UPPER\nsay x");
        assert_eq!(
            &tokens[..5],
            &[
                TokenKind::Symbol("X".into()),
                TokenKind::Assign,
                TokenKind::StringLit("a".into()),
                TokenKind::Pipe,
                TokenKind::Symbol("UPPER".into()),
            ]
        );
        assert_eq!(tokens[5], TokenKind::Eol);
    }

    #[test]
    fn trailing_comma_continues_statement() {
        let tokens = kinds("say 'a',\n  'b'");
        assert_eq!(tokens[1], TokenKind::StringLit("a".into()));
        assert_eq!(tokens[2], TokenKind::StringLit("b".into()));
    }

    #[test]
    fn heredoc_captures_raw_text() {
        let src = "code = <<PY\nprint('a |> b')  # /* not a comment\n  indented\nPY\nsay code";
        let tokens = kinds(src);
        assert_eq!(
            tokens[2],
            TokenKind::Heredoc("print('a |> b')  # /* not a comment\n  indented".into())
        );
        assert_eq!(tokens[3], TokenKind::Eol);
        assert_eq!(tokens[4], TokenKind::Symbol("SAY".into()));
    }

    #[test]
    fn heredoc_closes_only_on_exact_tag_line() {
        let src = "text = <<END\nline one\n  END\nEND \nline three\nEND\r\nsay text";
        let tokens = kinds(src);
        assert_eq!(
            tokens[2],
            TokenKind::Heredoc("line one\n  END\nEND \nline three".into())
        );
        assert_eq!(tokens[4], TokenKind::Symbol("SAY".into()));
    }

    #[test]
    fn strict_less_than_is_not_a_heredoc() {
        let tokens = kinds("say a << b");
        assert_eq!(tokens[2], TokenKind::StrictLt);
    }

    #[test]
    fn unterminated_heredoc_fails_with_position() {
        let err = Lexer::new("x = <<END\nnever closed\n").tokenize().unwrap_err();
        assert_eq!(err.error, RexxError::UnmatchedComment);
        assert_eq!(err.parse_position(), Some((1, 5)));
    }

    #[test]
    fn unterminated_string_fails() {
        let err = Lexer::new("say 'oops").tokenize().unwrap_err();
        assert_eq!(err.error, RexxError::UnmatchedComment);
    }

    #[test]
    fn newlines_inside_literals_do_not_end_clause() {
        let tokens = kinds("x = [1,\n 2,\n 3]\nsay x");
        let eol_count = tokens.iter().filter(|k| **k == TokenKind::Eol).count();
        assert_eq!(eol_count, 1);
        assert_eq!(
            tokens.iter().filter(|k| **k == TokenKind::Comma).count(),
            2
        );
    }

    #[test]
    fn nested_comments() {
        let tokens = kinds("/* outer /* inner */ still comment */ say 'hi'");
        assert_eq!(tokens[0], TokenKind::Symbol("SAY".into()));
    }

    #[test]
    fn hex_string() {
        let tokens = kinds("'48656C6C6F'x");
        assert_eq!(tokens[0], TokenKind::StringLit("Hello".into()));
    }

    #[test]
    fn doubled_quote_escape() {
        let tokens = kinds("'it''s'");
        assert_eq!(tokens[0], TokenKind::StringLit("it's".into()));
    }

    #[test]
    fn comparison_operators() {
        let tokens = kinds("a == b \\= c >> d");
        assert_eq!(tokens[1], TokenKind::StrictEq);
        assert_eq!(tokens[3], TokenKind::NotEqual);
        assert_eq!(tokens[5], TokenKind::StrictGt);
    }

    #[test]
    fn shebang_line_skipped() {
        let tokens = kinds("#!/usr/bin/env rexx\nsay 'hello'");
        assert_eq!(tokens[0], TokenKind::Eol);
        assert_eq!(tokens[1], TokenKind::Symbol("SAY".into()));
    }
}
