//! REXX recursive descent parser: tokens to AST.
//!
//! Consumes a `Vec<Token>` from the lexer and produces an `ast::Program`.
//! REXX has no reserved words; keywords like SAY, IF, DO are just symbols
//! recognised by context at the start of a clause. Inside expressions a
//! small set of "stop words" (THEN, TO, WITH...) ends the expression when
//! the surrounding instruction expects one of them next.

use crate::ast::{
    AddressAction, AssignTarget, BinOp, Clause, ClauseKind, Condition, ControlledLoop, DoBlock,
    DoKind, Expr, NumericFormSetting, NumericSetting, ParseSource, ParseTemplate, Program,
    SignalAction, TailElement, TemplateElement, UnaryOp,
};
use crate::error::{RexxDiagnostic, RexxError, RexxResult, SourceLoc};
use crate::lexer::{Lexer, Token, TokenKind};

/// Lex and parse a complete source text.
pub fn parse(source: &str) -> RexxResult<Program> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}

const DO_STOPS: &[&str] = &["TO", "BY", "FOR", "WHILE", "UNTIL"];
const REPEAT_STOPS: &[&str] = &["WHILE", "UNTIL"];

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Keywords that end the expression currently being parsed.
    stops: &'static [&'static str],
    /// Keywords that end the clause being parsed (ELSE after a THEN clause).
    clause_stops: &'static [&'static str],
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            stops: &[],
            clause_stops: &[],
        }
    }

    pub fn parse(&mut self) -> RexxResult<Program> {
        let mut clauses = Vec::new();
        self.skip_terminators();
        while !self.at_end() {
            let clause = self.parse_clause()?;
            self.finish_clause(&clause)?;
            clauses.push(clause);
            self.skip_terminators();
        }
        Ok(Program { clauses })
    }

    // ── helpers ──────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos];
        if !self.at_end() {
            self.pos += 1;
        }
        tok
    }

    fn loc(&self) -> SourceLoc {
        self.peek().loc.clone()
    }

    fn error(&self, error: RexxError, detail: impl Into<String>) -> RexxDiagnostic {
        RexxDiagnostic::new(error).at(self.loc()).with_detail(detail)
    }

    fn expect(&mut self, kind: &TokenKind) -> RexxResult<&Token> {
        if &self.tokens[self.pos].kind == kind {
            let tok = &self.tokens[self.pos];
            self.pos += 1;
            Ok(tok)
        } else {
            Err(self.error(
                RexxError::InvalidExpression,
                format!("expected {kind:?}, found {:?}", self.peek_kind()),
            ))
        }
    }

    /// True if the current token is a clause terminator (`;`, `Eol`, `Eof`).
    fn is_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Semicolon | TokenKind::Eol | TokenKind::Eof
        )
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Semicolon | TokenKind::Eol) {
            self.advance();
        }
    }

    fn expect_clause_end(&self) -> RexxResult<()> {
        if self.is_terminator() {
            Ok(())
        } else {
            Err(self.error(
                RexxError::InvalidDataOnEnd,
                format!("unexpected {:?}", self.peek_kind()),
            ))
        }
    }

    /// A label may share its line with the clause that follows it.
    fn finish_clause(&self, clause: &Clause) -> RexxResult<()> {
        if matches!(clause.kind, ClauseKind::Label(_)) {
            Ok(())
        } else {
            self.expect_clause_end()
        }
    }

    /// Peek ahead by `n` tokens (0 = current).
    fn peek_at(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    /// Is the current token the given keyword? Symbols are already upper-case.
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Symbol(s) if s == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, what: &str) -> RexxResult<String> {
        if let TokenKind::Symbol(name) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(
                RexxError::ExpectedSymbol,
                format!("expected {what}, found {:?}", self.peek_kind()),
            ))
        }
    }

    fn with_stops<T>(
        &mut self,
        stops: &'static [&'static str],
        f: impl FnOnce(&mut Self) -> RexxResult<T>,
    ) -> RexxResult<T> {
        let saved = std::mem::replace(&mut self.stops, stops);
        let result = f(self);
        self.stops = saved;
        result
    }

    fn with_clause_stops<T>(
        &mut self,
        stops: &'static [&'static str],
        f: impl FnOnce(&mut Self) -> RexxResult<T>,
    ) -> RexxResult<T> {
        let saved = std::mem::replace(&mut self.clause_stops, stops);
        let result = f(self);
        self.clause_stops = saved;
        result
    }

    /// Parse an expression that ends at any of `stops`.
    fn expression_until(&mut self, stops: &'static [&'static str]) -> RexxResult<Expr> {
        self.with_stops(stops, Self::parse_expression)
    }

    fn optional_expression(&mut self) -> RexxResult<Option<Expr>> {
        if self.is_terminator() {
            Ok(None)
        } else {
            self.expression_until(&[]).map(Some)
        }
    }

    // ── clause parsing ──────────────────────────────────────────────

    fn parse_clause(&mut self) -> RexxResult<Clause> {
        let loc = self.loc();

        if let TokenKind::Symbol(name) = self.peek_kind().clone() {
            // Symbol + Colon -> Label
            if matches!(self.peek_at(1), TokenKind::Colon) {
                self.advance(); // symbol
                self.advance(); // colon
                return Ok(Clause {
                    kind: ClauseKind::Label(name),
                    loc,
                });
            }

            // Symbol + = -> Assignment
            if matches!(self.peek_at(1), TokenKind::Assign) {
                return self.parse_assignment(loc);
            }

            if let Some(kind) = self.parse_instruction(&name)? {
                return Ok(Clause { kind, loc });
            }
        }

        // Default: command clause (expression evaluated and sent to ADDRESS)
        let expr = self.expression_until(&[])?;
        Ok(Clause {
            kind: ClauseKind::Command(expr),
            loc,
        })
    }

    /// Keyword instructions. `None` means the symbol is not a keyword here.
    fn parse_instruction(&mut self, keyword: &str) -> RexxResult<Option<ClauseKind>> {
        let kind = match keyword {
            "SAY" => {
                self.advance();
                // SAY with no expression outputs an empty line
                let expr = self
                    .optional_expression()?
                    .unwrap_or_else(|| Expr::StringLit(String::new()));
                ClauseKind::Say(expr)
            }
            "LET" => {
                self.advance();
                if !matches!(self.peek_kind(), TokenKind::Symbol(_))
                    || !matches!(self.peek_at(1), TokenKind::Assign)
                {
                    return Err(self.error(RexxError::ExpectedSymbol, "LET expects 'name = expr'"));
                }
                let loc = self.loc();
                return self.parse_assignment(loc).map(|c| Some(c.kind));
            }
            "NOP" => {
                self.advance();
                ClauseKind::Nop
            }
            "IF" => self.parse_if()?,
            "DO" => self.parse_do()?,
            "SELECT" => self.parse_select()?,
            "CALL" => self.parse_call()?,
            "RETURN" => {
                self.advance();
                ClauseKind::Return(self.optional_expression()?)
            }
            "EXIT" => {
                self.advance();
                ClauseKind::Exit(self.optional_expression()?)
            }
            "LEAVE" | "ITERATE" => {
                self.advance();
                let name = if self.is_terminator() {
                    None
                } else {
                    Some(self.expect_symbol("loop control variable")?)
                };
                if keyword == "LEAVE" {
                    ClauseKind::Leave(name)
                } else {
                    ClauseKind::Iterate(name)
                }
            }
            "SIGNAL" => self.parse_signal()?,
            "INTERPRET" => {
                self.advance();
                ClauseKind::Interpret(self.expression_until(&[])?)
            }
            "REQUIRE" => {
                self.advance();
                ClauseKind::Require(self.expression_until(&[])?)
            }
            "PARSE" => self.parse_parse()?,
            "ARG" => {
                self.advance();
                ClauseKind::Arg(self.parse_template()?)
            }
            "ADDRESS" => self.parse_address()?,
            "NUMERIC" => self.parse_numeric()?,
            "DROP" | "GLOBAL" => {
                self.advance();
                let mut names = Vec::new();
                while !self.is_terminator() {
                    let name = self.expect_symbol("variable name")?;
                    names.push(name.trim_end_matches('.').to_string());
                }
                if keyword == "DROP" {
                    ClauseKind::Drop(names)
                } else {
                    ClauseKind::Global(names)
                }
            }
            "THEN" | "ELSE" => {
                return Err(self.error(RexxError::UnexpectedThenElse, keyword.to_string()));
            }
            "WHEN" | "OTHERWISE" => {
                return Err(self.error(RexxError::UnexpectedWhenOtherwise, keyword.to_string()));
            }
            "END" => {
                return Err(self.error(RexxError::UnexpectedEnd, "END without DO or SELECT"));
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    fn parse_assignment(&mut self, loc: SourceLoc) -> RexxResult<Clause> {
        let name = self.expect_symbol("assignment target")?;
        self.advance(); // =

        let target = match name.split_once('.') {
            Some((stem, tail)) => AssignTarget::Stem {
                stem: stem.to_string(),
                tail: parse_tail_elements(tail),
            },
            None => AssignTarget::Simple(name),
        };

        let expr = self.expression_until(&[])?;
        Ok(Clause {
            kind: ClauseKind::Assignment { target, expr },
            loc,
        })
    }

    fn parse_if(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // IF
        let condition = self.expression_until(&["THEN"])?;
        self.skip_terminators();
        if !self.eat_keyword("THEN") {
            return Err(self.error(RexxError::ExpectedThen, "IF condition must be followed by THEN"));
        }
        self.skip_terminators();
        let then_clause = self.nested_clause(&["ELSE"])?;

        // ELSE may follow on the same line or after clause terminators.
        let before_else = self.pos;
        self.skip_terminators();
        let else_clause = if self.eat_keyword("ELSE") {
            self.skip_terminators();
            Some(Box::new(self.nested_clause(&[])?))
        } else {
            self.pos = before_else;
            None
        };

        Ok(ClauseKind::If {
            condition,
            then_clause: Box::new(then_clause),
            else_clause,
        })
    }

    /// A single clause governed by THEN/ELSE/WHEN, ending at `stops`.
    fn nested_clause(&mut self, stops: &'static [&'static str]) -> RexxResult<Clause> {
        if self.at_end() {
            return Err(self.error(RexxError::IncompleteBlock, "clause expected"));
        }
        self.with_clause_stops(stops, Self::parse_clause)
    }

    /// Clauses up to (and including) END. Returns the body; the END name, if
    /// any, is checked against `expected_name`.
    fn parse_block_body(&mut self, expected_name: Option<&str>) -> RexxResult<Vec<Clause>> {
        let mut body = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_end() {
                return Err(self.error(RexxError::IncompleteBlock, "END expected"));
            }
            if self.at_keyword("END") && !matches!(self.peek_at(1), TokenKind::Assign) {
                self.advance();
                if let TokenKind::Symbol(name) = self.peek_kind().clone()
                    && !self.clause_stops.contains(&name.as_str())
                {
                    if expected_name != Some(name.as_str()) {
                        return Err(self.error(
                            RexxError::UnexpectedEnd,
                            format!("END {name} does not match the enclosing DO"),
                        ));
                    }
                    self.advance();
                }
                return Ok(body);
            }
            let clause = self.with_clause_stops(&[], Self::parse_clause)?;
            self.finish_clause(&clause)?;
            body.push(clause);
        }
    }

    fn parse_do(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // DO
        let mut name = None;

        let kind = if self.is_terminator() {
            DoKind::Simple
        } else if self.eat_keyword("FOREVER") {
            DoKind::Forever
        } else if self.eat_keyword("WHILE") {
            DoKind::While(self.expression_until(&[])?)
        } else if self.eat_keyword("UNTIL") {
            DoKind::Until(self.expression_until(&[])?)
        } else if let TokenKind::Symbol(var) = self.peek_kind().clone()
            && matches!(self.peek_at(1), TokenKind::Assign)
        {
            self.advance(); // var
            self.advance(); // =
            name = Some(var.clone());
            DoKind::Controlled(Box::new(self.parse_controlled(var)?))
        } else if let TokenKind::Symbol(var) = self.peek_kind().clone()
            && matches!(self.peek_at(1), TokenKind::Symbol(s) if s == "OVER")
        {
            self.advance(); // var
            self.advance(); // OVER
            name = Some(var.clone());
            DoKind::Over {
                var,
                collection: self.expression_until(&[])?,
            }
        } else {
            DoKind::Count(self.expression_until(REPEAT_STOPS)?)
        };

        if !self.is_terminator() {
            return Err(self.error(
                RexxError::InvalidDoSyntax,
                format!("unexpected {:?} in DO", self.peek_kind()),
            ));
        }
        let body = self.parse_block_body(name.as_deref())?;
        Ok(ClauseKind::Do(Box::new(DoBlock { kind, body, name })))
    }

    fn parse_controlled(&mut self, var: String) -> RexxResult<ControlledLoop> {
        let start = self.expression_until(DO_STOPS)?;
        let mut ctrl = ControlledLoop {
            var,
            start,
            to: None,
            by: None,
            r#for: None,
            while_cond: None,
            until_cond: None,
        };
        while !self.is_terminator() {
            let keyword = self.expect_symbol("TO, BY, FOR, WHILE or UNTIL")?;
            let slot = match keyword.as_str() {
                "TO" => &mut ctrl.to,
                "BY" => &mut ctrl.by,
                "FOR" => &mut ctrl.r#for,
                "WHILE" => &mut ctrl.while_cond,
                "UNTIL" => &mut ctrl.until_cond,
                _ => {
                    return Err(self.error(
                        RexxError::InvalidDoSyntax,
                        format!("unexpected '{keyword}' in DO"),
                    ));
                }
            };
            if slot.is_some() {
                return Err(self.error(
                    RexxError::InvalidDoSyntax,
                    format!("duplicate {keyword} in DO"),
                ));
            }
            *slot = Some(self.expression_until(DO_STOPS)?);
        }
        if ctrl.while_cond.is_some() && ctrl.until_cond.is_some() {
            return Err(self.error(
                RexxError::InvalidDoSyntax,
                "WHILE and UNTIL cannot both be used",
            ));
        }
        Ok(ctrl)
    }

    fn parse_select(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // SELECT
        let mut when_clauses = Vec::new();
        let mut otherwise = None;

        loop {
            self.skip_terminators();
            if self.at_end() {
                return Err(self.error(RexxError::IncompleteBlock, "END expected for SELECT"));
            }
            if self.eat_keyword("WHEN") {
                if otherwise.is_some() {
                    return Err(self.error(
                        RexxError::UnexpectedWhenOtherwise,
                        "WHEN after OTHERWISE",
                    ));
                }
                let condition = self.expression_until(&["THEN"])?;
                self.skip_terminators();
                if !self.eat_keyword("THEN") {
                    return Err(self.error(RexxError::ExpectedThen, "WHEN must be followed by THEN"));
                }
                self.skip_terminators();
                let body = self.nested_clause(&[])?;
                self.expect_clause_end()?;
                when_clauses.push((condition, vec![body]));
            } else if self.eat_keyword("OTHERWISE") {
                let mut body = Vec::new();
                loop {
                    self.skip_terminators();
                    if self.at_end() || self.at_keyword("END") {
                        break;
                    }
                    body.push(self.nested_clause(&[])?);
                    self.expect_clause_end()?;
                }
                otherwise = Some(body);
            } else if self.eat_keyword("END") {
                break;
            } else {
                return Err(self.error(
                    RexxError::InvalidSubKeyword,
                    "WHEN, OTHERWISE or END expected in SELECT",
                ));
            }
        }

        if when_clauses.is_empty() {
            return Err(self.error(
                RexxError::IncompleteBlock,
                "SELECT requires at least one WHEN",
            ));
        }
        Ok(ClauseKind::Select {
            when_clauses,
            otherwise,
        })
    }

    fn parse_call(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // CALL
        let name = match self.peek_kind().clone() {
            TokenKind::Symbol(s) => s,
            TokenKind::StringLit(s) => s.to_uppercase(),
            other => {
                return Err(self.error(
                    RexxError::ExpectedStringOrSymbol,
                    format!("CALL expects a routine name, found {other:?}"),
                ));
            }
        };
        self.advance();

        // `CALL name(a, b)` is accepted as well as `CALL name a, b`.
        if matches!(self.peek_kind(), TokenKind::LeftParen) && !self.peek().space_before {
            let args = self.with_stops(&[], Self::parse_argument_list)?;
            return Ok(ClauseKind::Call { name, args });
        }

        let mut args = Vec::new();
        if !self.is_terminator() {
            args.push(self.expression_until(&[])?);
            while matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                args.push(self.expression_until(&[])?);
            }
        }
        Ok(ClauseKind::Call { name, args })
    }

    fn parse_signal(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // SIGNAL
        let action = if self.at_keyword("ON") || self.at_keyword("OFF") {
            let on = self.at_keyword("ON");
            self.advance();
            let word = self.expect_symbol("condition name")?;
            let condition = Condition::from_keyword(&word).ok_or_else(|| {
                self.error(
                    RexxError::InvalidSubKeyword,
                    format!("'{word}' is not a trappable condition"),
                )
            })?;
            if on {
                let name = if self.eat_keyword("NAME") {
                    Some(self.expect_symbol("trap label")?)
                } else {
                    None
                };
                SignalAction::On { condition, name }
            } else {
                SignalAction::Off(condition)
            }
        } else if self.eat_keyword("VALUE") {
            SignalAction::Value(self.expression_until(&[])?)
        } else {
            match self.peek_kind().clone() {
                TokenKind::Symbol(label) => {
                    self.advance();
                    SignalAction::Label(label)
                }
                TokenKind::StringLit(label) => {
                    self.advance();
                    SignalAction::Label(label.to_uppercase())
                }
                _ => {
                    return Err(self.error(RexxError::ExpectedStringOrSymbol, "SIGNAL target expected"));
                }
            }
        };
        Ok(ClauseKind::Signal(action))
    }

    fn parse_parse(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // PARSE
        let upper = self.eat_keyword("UPPER");
        let source = if self.eat_keyword("ARG") {
            ParseSource::Arg
        } else if self.eat_keyword("VAR") {
            ParseSource::Var(self.expect_symbol("variable name")?)
        } else if self.eat_keyword("VALUE") {
            let expr = if self.at_keyword("WITH") {
                Expr::StringLit(String::new())
            } else {
                self.expression_until(&["WITH"])?
            };
            if !self.eat_keyword("WITH") {
                return Err(self.error(RexxError::InvalidSubKeyword, "PARSE VALUE requires WITH"));
            }
            ParseSource::Value(expr)
        } else {
            return Err(self.error(
                RexxError::InvalidSubKeyword,
                "PARSE expects ARG, VAR or VALUE",
            ));
        };
        let template = self.parse_template()?;
        Ok(ClauseKind::Parse {
            upper,
            source,
            template,
        })
    }

    fn parse_template(&mut self) -> RexxResult<ParseTemplate> {
        let mut elements = Vec::new();
        while !self.is_terminator() {
            let element = match self.peek_kind().clone() {
                TokenKind::Symbol(name) => TemplateElement::Variable(name),
                TokenKind::Dot => TemplateElement::Dot,
                TokenKind::Comma => TemplateElement::Comma,
                TokenKind::StringLit(s) | TokenKind::Heredoc(s) => TemplateElement::Literal(s),
                TokenKind::Number(n) => TemplateElement::AbsolutePos(Expr::Number(n)),
                TokenKind::Assign => {
                    self.advance();
                    let pos = match self.peek_kind().clone() {
                        TokenKind::Number(n) => Expr::Number(n),
                        TokenKind::LeftParen => {
                            self.advance();
                            let name = self.expect_symbol("position variable")?;
                            if !matches!(self.peek_kind(), TokenKind::RightParen) {
                                return Err(self.error(RexxError::UnmatchedParen, "')' expected"));
                            }
                            Expr::Symbol(name)
                        }
                        _ => {
                            return Err(self.error(RexxError::InvalidTemplate, "position expected after '='"));
                        }
                    };
                    self.advance();
                    elements.push(TemplateElement::AbsolutePos(pos));
                    continue;
                }
                TokenKind::Plus | TokenKind::Minus => {
                    let negative = matches!(self.peek_kind(), TokenKind::Minus);
                    self.advance();
                    let TokenKind::Number(n) = self.peek_kind().clone() else {
                        return Err(self.error(RexxError::InvalidTemplate, "relative position expected"));
                    };
                    let offset: i32 = n.parse().map_err(|_| {
                        self.error(RexxError::InvalidTemplate, format!("'{n}' is not a whole number"))
                    })?;
                    TemplateElement::RelativePos(if negative { -offset } else { offset })
                }
                TokenKind::LeftParen => {
                    self.advance();
                    let name = self.expect_symbol("pattern variable")?;
                    if !matches!(self.peek_kind(), TokenKind::RightParen) {
                        return Err(self.error(RexxError::UnmatchedParen, "')' expected"));
                    }
                    TemplateElement::VariablePattern(name)
                }
                other => {
                    return Err(self.error(
                        RexxError::InvalidTemplate,
                        format!("unexpected {other:?} in template"),
                    ));
                }
            };
            self.advance();
            elements.push(element);
        }
        Ok(ParseTemplate { elements })
    }

    fn parse_address(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // ADDRESS
        if self.is_terminator() {
            return Ok(ClauseKind::Address(AddressAction::SetEnvironment(String::new())));
        }
        if self.at_keyword("VALUE")
            && !matches!(
                self.peek_at(1),
                TokenKind::Eol | TokenKind::Eof | TokenKind::Semicolon
            )
        {
            self.advance();
            return Ok(ClauseKind::Address(AddressAction::Value(
                self.expression_until(&[])?,
            )));
        }
        let environment = match self.peek_kind().clone() {
            TokenKind::Symbol(s) => s,
            TokenKind::StringLit(s) => s.to_uppercase(),
            other => {
                return Err(self.error(
                    RexxError::ExpectedStringOrSymbol,
                    format!("ADDRESS expects an environment name, found {other:?}"),
                ));
            }
        };
        self.advance();
        if self.is_terminator() {
            return Ok(ClauseKind::Address(AddressAction::SetEnvironment(environment)));
        }
        let command = self.expression_until(&[])?;
        Ok(ClauseKind::Address(AddressAction::Temporary {
            environment,
            command,
        }))
    }

    fn parse_numeric(&mut self) -> RexxResult<ClauseKind> {
        self.advance(); // NUMERIC
        let setting = if self.eat_keyword("DIGITS") {
            NumericSetting::Digits(self.optional_expression()?)
        } else if self.eat_keyword("FUZZ") {
            NumericSetting::Fuzz(self.optional_expression()?)
        } else if self.eat_keyword("FORM") {
            if self.eat_keyword("SCIENTIFIC") || self.is_terminator() {
                NumericSetting::Form(NumericFormSetting::Scientific)
            } else if self.eat_keyword("ENGINEERING") {
                NumericSetting::Form(NumericFormSetting::Engineering)
            } else {
                self.eat_keyword("VALUE");
                NumericSetting::Form(NumericFormSetting::Value(self.expression_until(&[])?))
            }
        } else {
            return Err(self.error(
                RexxError::InvalidSubKeyword,
                "NUMERIC expects DIGITS, FUZZ or FORM",
            ));
        };
        Ok(ClauseKind::Numeric(setting))
    }

    // ── expression parsing (precedence climbing) ────────────────────
    //
    // Lowest to highest:
    //   0. pipe        (|>)  : right associative
    //   1. OR / XOR    (| &&)
    //   2. AND         (&)
    //   3. comparison  (= \= > < >= <= == \== >> << >>= <<=)
    //   4. concat      (blank-concat, ||, abuttal)
    //   5. add / sub   (+ -)
    //   6. mul / div   (* / % //)
    //   7. power       (**)  : right associative
    //   8. unary       (+ - \)
    //   9. primary     (literals, symbols, parens, calls, [..], {..})

    fn parse_expression(&mut self) -> RexxResult<Expr> {
        self.parse_pipe()
    }

    // Level 0: pipe. `a |> f |> g` nests as Pipe(a, Pipe(f, g)).
    fn parse_pipe(&mut self) -> RexxResult<Expr> {
        let value = self.parse_or_xor()?;
        if matches!(self.peek_kind(), TokenKind::Pipe) {
            self.advance();
            let stage = self.parse_pipe()?;
            return Ok(Expr::Pipe {
                value: Box::new(value),
                stage: Box::new(stage),
            });
        }
        Ok(value)
    }

    // Level 1: OR (|) and XOR (&&)
    fn parse_or_xor(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_and()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Or => BinOp::Or,
                TokenKind::Xor => BinOp::Xor,
                _ => break,
            };
            self.advance();
            let right = self.parse_and()?;
            left = binop(left, op, right);
        }
        Ok(left)
    }

    // Level 2: AND (&)
    fn parse_and(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek_kind(), TokenKind::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = binop(left, BinOp::And, right);
        }
        Ok(left)
    }

    // Level 3: comparison operators
    fn parse_comparison(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek_kind() {
                // = at expression level is comparison, not assignment
                TokenKind::Assign => BinOp::Eq,
                TokenKind::NotEqual => BinOp::NotEq,
                TokenKind::Greater => BinOp::Gt,
                TokenKind::Less => BinOp::Lt,
                TokenKind::GreaterEq => BinOp::GtEq,
                TokenKind::LessEq => BinOp::LtEq,
                TokenKind::StrictEq => BinOp::StrictEq,
                TokenKind::StrictNotEq => BinOp::StrictNotEq,
                TokenKind::StrictGt => BinOp::StrictGt,
                TokenKind::StrictLt => BinOp::StrictLt,
                TokenKind::StrictGte => BinOp::StrictGtEq,
                TokenKind::StrictLte => BinOp::StrictLtEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = binop(left, op, right);
        }
        Ok(left)
    }

    // Level 4: concatenation (||, blank-concat, abuttal)
    fn parse_concat(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_addition()?;
        loop {
            // Explicit || concat
            if matches!(self.peek_kind(), TokenKind::Concat) {
                self.advance();
                let right = self.parse_addition()?;
                left = binop(left, BinOp::Concat, right);
                continue;
            }

            // Implicit concatenation: the next token can start a term and
            // is not a binary operator; spacing picks blank vs abuttal.
            if self.can_start_term() && !self.is_binary_op() {
                let op = if self.peek().space_before {
                    BinOp::ConcatBlank
                } else {
                    BinOp::Concat
                };
                let right = self.parse_addition()?;
                left = binop(left, op, right);
                continue;
            }

            break;
        }
        Ok(left)
    }

    /// True if the current token could start a primary expression term.
    fn can_start_term(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Symbol(name) => {
                !self.stops.contains(&name.as_str()) && !self.clause_stops.contains(&name.as_str())
            }
            TokenKind::StringLit(_)
            | TokenKind::Heredoc(_)
            | TokenKind::Number(_)
            | TokenKind::LeftParen
            | TokenKind::LeftBracket
            | TokenKind::LeftBrace
            | TokenKind::Not => true,
            _ => false,
        }
    }

    /// True if the current token is a binary operator (not concat-related).
    fn is_binary_op(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::IntDiv
                | TokenKind::Remainder
                | TokenKind::Power
                | TokenKind::Assign
                | TokenKind::NotEqual
                | TokenKind::Greater
                | TokenKind::Less
                | TokenKind::GreaterEq
                | TokenKind::LessEq
                | TokenKind::StrictEq
                | TokenKind::StrictNotEq
                | TokenKind::StrictGt
                | TokenKind::StrictLt
                | TokenKind::StrictGte
                | TokenKind::StrictLte
                | TokenKind::And
                | TokenKind::Or
                | TokenKind::Xor
                | TokenKind::Concat
                | TokenKind::Pipe
        )
    }

    // Level 5: addition / subtraction
    fn parse_addition(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_multiplication()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplication()?;
            left = binop(left, op, right);
        }
        Ok(left)
    }

    // Level 6: multiplication / division
    fn parse_multiplication(&mut self) -> RexxResult<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::IntDiv => BinOp::IntDiv,
                TokenKind::Remainder => BinOp::Remainder,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = binop(left, op, right);
        }
        Ok(left)
    }

    // Level 7: power (**): right associative
    fn parse_power(&mut self) -> RexxResult<Expr> {
        let base = self.parse_unary()?;
        if matches!(self.peek_kind(), TokenKind::Power) {
            self.advance();
            let exp = self.parse_power()?; // right-recursive for right-assoc
            Ok(binop(base, BinOp::Power, exp))
        } else {
            Ok(base)
        }
    }

    // Level 8: unary prefix (+ - \)
    fn parse_unary(&mut self) -> RexxResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Minus => UnaryOp::Minus,
            TokenKind::Not => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    // Level 9: primary expressions
    fn parse_primary(&mut self) -> RexxResult<Expr> {
        match self.peek_kind().clone() {
            TokenKind::StringLit(s) | TokenKind::Heredoc(s) => {
                self.advance();
                Ok(Expr::StringLit(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Symbol(name) => {
                self.advance();
                // Function call: symbol immediately followed by '(' (no space)
                if matches!(self.peek_kind(), TokenKind::LeftParen) && !self.peek().space_before {
                    let args = self.with_stops(&[], Self::parse_argument_list)?;
                    return Ok(Expr::FunctionCall { name, args });
                }
                Ok(symbol_expr(name))
            }
            TokenKind::LeftParen => {
                self.advance(); // (
                let expr = self.expression_until(&[])?;
                if !matches!(self.peek_kind(), TokenKind::RightParen) {
                    return Err(self.error(RexxError::UnmatchedParen, "expected closing ')'"));
                }
                self.advance();
                Ok(Expr::Paren(Box::new(expr)))
            }
            TokenKind::LeftBracket => self.with_stops(&[], Self::parse_array_literal),
            TokenKind::LeftBrace => self.with_stops(&[], Self::parse_object_literal),
            TokenKind::Eol | TokenKind::Eof | TokenKind::Semicolon => Err(self.error(
                RexxError::InvalidExpression,
                "expression expected before end of clause",
            )),
            other => Err(self.error(
                RexxError::InvalidExpression,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    /// `( [expr {, expr}] )`: the opening paren is the current token.
    fn parse_argument_list(&mut self) -> RexxResult<Vec<Expr>> {
        self.advance(); // (
        let mut args = Vec::new();
        if !matches!(self.peek_kind(), TokenKind::RightParen) {
            args.push(self.parse_expression()?);
            while matches!(self.peek_kind(), TokenKind::Comma) {
                self.advance();
                args.push(self.parse_expression()?);
            }
        }
        if !matches!(self.peek_kind(), TokenKind::RightParen) {
            return Err(self.error(
                RexxError::UnmatchedParen,
                "expected ')' after function arguments",
            ));
        }
        self.advance();
        Ok(args)
    }

    fn parse_array_literal(&mut self) -> RexxResult<Expr> {
        self.advance(); // [
        let mut items = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RightBracket) {
            items.push(self.parse_expression()?);
            self.list_separator(&TokenKind::RightBracket, "array")?;
        }
        self.advance(); // ]
        Ok(Expr::ArrayLit(items))
    }

    fn parse_object_literal(&mut self) -> RexxResult<Expr> {
        self.advance(); // {
        let mut entries = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RightBrace) {
            let token = self.peek();
            let key = match &token.kind {
                TokenKind::Symbol(s) => token.spelling.clone().unwrap_or_else(|| s.clone()),
                TokenKind::StringLit(s) | TokenKind::Number(s) => s.clone(),
                other => {
                    return Err(self.error(
                        RexxError::ExpectedStringOrSymbol,
                        format!("object key expected, found {other:?}"),
                    ));
                }
            };
            self.advance();
            self.expect(&TokenKind::Colon)?;
            entries.push((key, self.parse_expression()?));
            self.list_separator(&TokenKind::RightBrace, "object")?;
        }
        self.advance(); // }
        Ok(Expr::ObjectLit(entries))
    }

    /// After a literal element: consume `,` or stop before `close`.
    fn list_separator(&mut self, close: &TokenKind, what: &str) -> RexxResult<()> {
        if matches!(self.peek_kind(), TokenKind::Comma) {
            self.advance();
            Ok(())
        } else if self.peek_kind() == close {
            Ok(())
        } else {
            Err(self.error(
                RexxError::UnexpectedCommaOrParen,
                format!("expected ',' or {close:?} in {what} literal, found {:?}", self.peek_kind()),
            ))
        }
    }
}

fn binop(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr::BinOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

/// `name`, `stem.tail...` or `stem.` (the whole stem).
fn symbol_expr(name: String) -> Expr {
    match name.split_once('.') {
        Some((stem, "")) if !stem.is_empty() => Expr::Symbol(stem.to_string()),
        Some((stem, tail)) if !stem.is_empty() => Expr::Compound {
            stem: stem.to_string(),
            tail: parse_tail_elements(tail),
        },
        _ => Expr::Symbol(name),
    }
}

/// Parse tail elements from the string after the first dot in a compound symbol.
/// E.g. for `arr.i.j`, after splitting on the first dot we get `"i.j"`,
/// which produces `[Var("I"), Var("J")]`.
pub(crate) fn parse_tail_elements(tail: &str) -> Vec<TailElement> {
    tail.split('.')
        .map(|part| {
            if part.is_empty() || part.starts_with(|c: char| c.is_ascii_digit()) {
                TailElement::Const(part.to_string())
            } else {
                TailElement::Var(part.to_string())
            }
        })
        .collect()
}
