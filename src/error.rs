//! REXX error types and error message formatting.
//!
//! REXX defines specific error numbers (e.g., Error 41 = Bad arithmetic conversion).
//! This module maps Rust error handling to REXX's error numbering system
//! while providing modern, helpful diagnostics. Every error also belongs to an
//! [`ErrorCategory`], which is what the executor and the CLI use to decide
//! whether a failure halts the run and which exit status it produces.

use std::fmt;

/// Source location for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub line: usize,
    pub col: usize,
    /// Original source line text for display.
    pub source_line: Option<String>,
}

impl SourceLoc {
    pub fn new(line: usize, col: usize) -> Self {
        Self {
            line,
            col,
            source_line: None,
        }
    }

    pub fn with_source(mut self, text: String) -> Self {
        self.source_line = Some(text);
        self
    }
}

/// Broad failure classes. The executor is the only place that decides
/// what each class does to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed source; reported before anything executes.
    Parse,
    /// Recoverable runtime condition (bad number, NOWHEN, missing routine...).
    /// Terminates the script unless trapped with `SIGNAL ON SYNTAX`.
    Condition,
    /// An ADDRESS handler failed while the fail-fast policy was active.
    Dispatch,
    /// A REQUIRE could not be resolved (missing module or cycle).
    Resolution,
    /// INTERPRET nesting or call depth exceeded its ceiling.
    ResourceExhaustion,
    /// The run was cancelled from outside.
    Halt,
}

impl ErrorCategory {
    /// Process exit status used by the `rexx` binary for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Condition => 1,
            Self::Parse => 2,
            Self::Dispatch => 3,
            Self::Resolution => 4,
            Self::ResourceExhaustion => 5,
            Self::Halt => 130,
        }
    }
}

/// REXX error numbers per ANSI X3.274-1996 §A, plus the numbers this
/// dialect adds for library resolution (90+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RexxError {
    /// 4: Program interrupted (HALT condition)
    Halt,
    /// 5: System resources exhausted
    ResourceExhausted,
    /// 6: Unmatched /* or quote
    UnmatchedComment,
    /// 7: WHEN or OTHERWISE expected (raised as NOWHEN at runtime)
    ExpectedWhenOtherwise,
    /// 8: Unexpected THEN or ELSE
    UnexpectedThenElse,
    /// 9: Unexpected WHEN or OTHERWISE
    UnexpectedWhenOtherwise,
    /// 10: Unexpected or unmatched END
    UnexpectedEnd,
    /// 13: Invalid character in program
    InvalidCharacter,
    /// 14: Incomplete DO/SELECT/IF
    IncompleteBlock,
    /// 15: Invalid hexadecimal or binary string
    InvalidHexBinary,
    /// 16: Label not found (SIGNAL target)
    LabelNotFound,
    /// 18: THEN expected
    ExpectedThen,
    /// 19: String or symbol expected
    ExpectedStringOrSymbol,
    /// 20: Symbol expected
    ExpectedSymbol,
    /// 21: Invalid data on end of clause
    InvalidDataOnEnd,
    /// 25: Invalid sub-keyword found
    InvalidSubKeyword,
    /// 26: Invalid whole number
    InvalidWholeNumber,
    /// 27: Invalid DO syntax
    InvalidDoSyntax,
    /// 28: Invalid LEAVE or ITERATE
    InvalidLeaveIterate,
    /// 34: Logical value not 0 or 1
    InvalidLogicalValue,
    /// 35: Invalid expression
    InvalidExpression,
    /// 36: Unmatched "(" in expression
    UnmatchedParen,
    /// 37: Unexpected "," or ")"
    UnexpectedCommaOrParen,
    /// 38: Invalid template or pattern
    InvalidTemplate,
    /// 40: Incorrect call to routine
    IncorrectCall,
    /// 41: Bad arithmetic conversion (the INVALID-NUMBER condition)
    BadArithmetic,
    /// 42: Arithmetic overflow/underflow
    ArithmeticOverflow,
    /// 43: Routine not found
    RoutineNotFound,
    /// 44: Function did not return data
    NoReturnData,
    /// 46: Invalid variable reference
    InvalidVariableRef,
    /// 48: Failure in system service
    SystemFailure,
    /// 49: Interpretation error (INTERPRET issues)
    InterpretationError,
    /// 90: REQUIRE target not found
    LibraryNotFound,
    /// 91: REQUIRE dependency cycle
    LibraryCycle,
}

impl RexxError {
    /// The REXX error number.
    pub fn number(self) -> u32 {
        match self {
            Self::Halt => 4,
            Self::ResourceExhausted => 5,
            Self::UnmatchedComment => 6,
            Self::ExpectedWhenOtherwise => 7,
            Self::UnexpectedThenElse => 8,
            Self::UnexpectedWhenOtherwise => 9,
            Self::UnexpectedEnd => 10,
            Self::InvalidCharacter => 13,
            Self::IncompleteBlock => 14,
            Self::InvalidHexBinary => 15,
            Self::LabelNotFound => 16,
            Self::ExpectedThen => 18,
            Self::ExpectedStringOrSymbol => 19,
            Self::ExpectedSymbol => 20,
            Self::InvalidDataOnEnd => 21,
            Self::InvalidSubKeyword => 25,
            Self::InvalidWholeNumber => 26,
            Self::InvalidDoSyntax => 27,
            Self::InvalidLeaveIterate => 28,
            Self::InvalidLogicalValue => 34,
            Self::InvalidExpression => 35,
            Self::UnmatchedParen => 36,
            Self::UnexpectedCommaOrParen => 37,
            Self::InvalidTemplate => 38,
            Self::IncorrectCall => 40,
            Self::BadArithmetic => 41,
            Self::ArithmeticOverflow => 42,
            Self::RoutineNotFound => 43,
            Self::NoReturnData => 44,
            Self::InvalidVariableRef => 46,
            Self::SystemFailure => 48,
            Self::InterpretationError => 49,
            Self::LibraryNotFound => 90,
            Self::LibraryCycle => 91,
        }
    }

    /// Standard REXX error message text.
    pub fn message(self) -> &'static str {
        match self {
            Self::Halt => "Program interrupted",
            Self::ResourceExhausted => "System resources exhausted",
            Self::UnmatchedComment => "Unmatched /* or quote",
            Self::ExpectedWhenOtherwise => "WHEN or OTHERWISE expected",
            Self::UnexpectedThenElse => "Unexpected THEN or ELSE",
            Self::UnexpectedWhenOtherwise => "Unexpected WHEN or OTHERWISE",
            Self::UnexpectedEnd => "Unexpected or unmatched END",
            Self::InvalidCharacter => "Invalid character in program",
            Self::IncompleteBlock => "Incomplete DO/SELECT/IF",
            Self::InvalidHexBinary => "Invalid hexadecimal or binary string",
            Self::LabelNotFound => "Label not found",
            Self::ExpectedThen => "THEN expected",
            Self::ExpectedStringOrSymbol => "String or symbol expected",
            Self::ExpectedSymbol => "Symbol expected",
            Self::InvalidDataOnEnd => "Invalid data on end of clause",
            Self::InvalidSubKeyword => "Invalid sub-keyword found",
            Self::InvalidWholeNumber => "Invalid whole number",
            Self::InvalidDoSyntax => "Invalid DO syntax",
            Self::InvalidLeaveIterate => "Invalid LEAVE or ITERATE",
            Self::InvalidLogicalValue => "Logical value not 0 or 1",
            Self::InvalidExpression => "Invalid expression",
            Self::UnmatchedParen => "Unmatched \"(\" in expression",
            Self::UnexpectedCommaOrParen => "Unexpected \",\" or \")\"",
            Self::InvalidTemplate => "Invalid template or pattern",
            Self::IncorrectCall => "Incorrect call to routine",
            Self::BadArithmetic => "Bad arithmetic conversion",
            Self::ArithmeticOverflow => "Arithmetic overflow/underflow",
            Self::RoutineNotFound => "Routine not found",
            Self::NoReturnData => "Function did not return data",
            Self::InvalidVariableRef => "Invalid variable reference",
            Self::SystemFailure => "Failure in system service",
            Self::InterpretationError => "Interpretation error",
            Self::LibraryNotFound => "Library not found",
            Self::LibraryCycle => "Cyclic library dependency",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::Halt => ErrorCategory::Halt,
            Self::ResourceExhausted => ErrorCategory::ResourceExhaustion,
            Self::UnmatchedComment
            | Self::UnexpectedThenElse
            | Self::UnexpectedWhenOtherwise
            | Self::UnexpectedEnd
            | Self::InvalidCharacter
            | Self::IncompleteBlock
            | Self::InvalidHexBinary
            | Self::ExpectedThen
            | Self::ExpectedStringOrSymbol
            | Self::ExpectedSymbol
            | Self::InvalidDataOnEnd
            | Self::InvalidSubKeyword
            | Self::InvalidDoSyntax
            | Self::InvalidExpression
            | Self::UnmatchedParen
            | Self::UnexpectedCommaOrParen
            | Self::InvalidTemplate => ErrorCategory::Parse,
            Self::SystemFailure => ErrorCategory::Dispatch,
            Self::LibraryNotFound | Self::LibraryCycle => ErrorCategory::Resolution,
            Self::ExpectedWhenOtherwise
            | Self::LabelNotFound
            | Self::InvalidWholeNumber
            | Self::InvalidLeaveIterate
            | Self::InvalidLogicalValue
            | Self::IncorrectCall
            | Self::BadArithmetic
            | Self::ArithmeticOverflow
            | Self::RoutineNotFound
            | Self::NoReturnData
            | Self::InvalidVariableRef
            | Self::InterpretationError => ErrorCategory::Condition,
        }
    }

    /// Condition name a script sees in `CONDITION('D')`-style reporting.
    pub fn condition_name(self) -> &'static str {
        match self {
            Self::BadArithmetic => "INVALID-NUMBER",
            Self::ExpectedWhenOtherwise => "NOWHEN",
            Self::InvalidVariableRef => "NOVALUE",
            Self::Halt => "HALT",
            _ => "SYNTAX",
        }
    }
}

/// A REXX runtime/parse error with location and context.
#[derive(Debug, Clone)]
pub struct RexxDiagnostic {
    pub error: RexxError,
    pub location: Option<SourceLoc>,
    pub detail: Option<String>,
}

impl RexxDiagnostic {
    pub fn new(error: RexxError) -> Self {
        Self {
            error,
            location: None,
            detail: None,
        }
    }

    pub fn at(mut self, loc: SourceLoc) -> Self {
        self.location = Some(loc);
        self
    }

    /// Attach a location only if none is recorded yet, so the innermost
    /// position wins as an error bubbles out through nested clauses.
    pub fn or_at(mut self, loc: &SourceLoc) -> Self {
        if self.location.is_none() {
            self.location = Some(loc.clone());
        }
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }

    /// `(line, col)` of a parse failure, if this is one.
    pub fn parse_position(&self) -> Option<(usize, usize)> {
        if self.category() != ErrorCategory::Parse {
            return None;
        }
        self.location.as_ref().map(|loc| (loc.line, loc.col))
    }
}

impl fmt::Display for RexxDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error {} — {}",
            self.error.number(),
            self.error.message()
        )?;

        if let Some(ref detail) = self.detail {
            write!(f, ": {detail}")?;
        }

        if let Some(ref loc) = self.location {
            write!(f, "\n  at line {}, column {}", loc.line, loc.col)?;
            if let Some(ref source) = loc.source_line {
                write!(f, "\n  | {source}")?;
                write!(f, "\n  | {:>width$}", "^", width = loc.col)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for RexxDiagnostic {}

/// Convenience alias.
pub type RexxResult<T> = Result<T, RexxDiagnostic>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_number_detail_and_caret() {
        let diag = RexxDiagnostic::new(RexxError::BadArithmetic)
            .with_detail("'abc' is not a number")
            .at(SourceLoc::new(3, 5).with_source("x = abc + 1".into()));
        let text = diag.to_string();
        assert!(text.starts_with("Error 41 — Bad arithmetic conversion"));
        assert!(text.contains("'abc' is not a number"));
        assert!(text.contains("at line 3, column 5"));
        assert!(text.contains("|     ^"));
    }

    #[test]
    fn categories_drive_exit_codes() {
        assert_eq!(RexxError::InvalidExpression.category(), ErrorCategory::Parse);
        assert_eq!(RexxError::ResourceExhausted.category().exit_code(), 5);
        assert_eq!(RexxError::LibraryCycle.category(), ErrorCategory::Resolution);
        assert_ne!(
            ErrorCategory::Parse.exit_code(),
            ErrorCategory::ResourceExhaustion.exit_code()
        );
    }

    #[test]
    fn or_at_keeps_innermost_location() {
        let diag = RexxDiagnostic::new(RexxError::RoutineNotFound)
            .at(SourceLoc::new(7, 1))
            .or_at(&SourceLoc::new(2, 1));
        assert_eq!(diag.location.unwrap().line, 7);
    }

    #[test]
    fn parse_position_only_for_parse_failures() {
        let parse = RexxDiagnostic::new(RexxError::UnmatchedComment).at(SourceLoc::new(4, 9));
        assert_eq!(parse.parse_position(), Some((4, 9)));
        let runtime = RexxDiagnostic::new(RexxError::BadArithmetic).at(SourceLoc::new(4, 9));
        assert_eq!(runtime.parse_position(), None);
    }

    #[test]
    fn condition_names() {
        assert_eq!(RexxError::BadArithmetic.condition_name(), "INVALID-NUMBER");
        assert_eq!(RexxError::ExpectedWhenOtherwise.condition_name(), "NOWHEN");
    }
}
