//! REXX abstract syntax tree.
//!
//! A program is a flat sequence of clauses. Each clause is a label, an
//! instruction, an assignment, or a command (a string sent to the active
//! ADDRESS environment). Blocks own their nested clauses.

use crate::error::SourceLoc;

/// A complete REXX program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub clauses: Vec<Clause>,
}

/// A single REXX clause with its source location.
#[derive(Debug, Clone)]
pub struct Clause {
    pub kind: ClauseKind,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub enum ClauseKind {
    /// A label (e.g., `myLabel:`)
    Label(String),

    /// `symbol = expr` or `LET symbol = expr`
    Assignment { target: AssignTarget, expr: Expr },

    /// SAY expr
    Say(Expr),

    /// CALL routine [args...]
    Call { name: String, args: Vec<Expr> },

    /// DO block (many variants)
    Do(Box<DoBlock>),

    /// IF expr THEN clause [ELSE clause]
    If {
        condition: Expr,
        then_clause: Box<Clause>,
        else_clause: Option<Box<Clause>>,
    },

    /// SELECT [WHEN expr THEN clause]... [OTHERWISE clause...] END
    Select {
        when_clauses: Vec<(Expr, Vec<Clause>)>,
        otherwise: Option<Vec<Clause>>,
    },

    /// RETURN [expr]
    Return(Option<Expr>),

    /// EXIT [expr]
    Exit(Option<Expr>),

    /// ITERATE [name]
    Iterate(Option<String>),

    /// LEAVE [name]
    Leave(Option<String>),

    /// NOP
    Nop,

    /// PARSE [UPPER] source template
    Parse {
        upper: bool,
        source: ParseSource,
        template: ParseTemplate,
    },

    /// ARG template: shorthand for PARSE UPPER ARG template
    Arg(ParseTemplate),

    /// SIGNAL label | SIGNAL VALUE expr | SIGNAL ON/OFF condition
    Signal(SignalAction),

    /// NUMERIC DIGITS [expr] | NUMERIC FORM ... | NUMERIC FUZZ [expr]
    Numeric(NumericSetting),

    /// ADDRESS [environment [command]] | ADDRESS VALUE expr
    Address(AddressAction),

    /// INTERPRET expr
    Interpret(Expr),

    /// REQUIRE expr: load a library and its dependencies
    Require(Expr),

    /// DROP name [name...]
    Drop(Vec<String>),

    /// GLOBAL name [name...]: names shared by every call frame
    Global(Vec<String>),

    /// A command clause: expression evaluated and sent to current environment
    Command(Expr),
}

/// Assignment targets: simple variables or stem compounds.
#[derive(Debug, Clone)]
pub enum AssignTarget {
    /// Simple variable: `x = 5`
    Simple(String),
    /// Stem compound: `stem.tail = 5` (empty tail is `stem. = 5`)
    Stem {
        stem: String,
        tail: Vec<TailElement>,
    },
}

/// Elements of a compound variable tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailElement {
    Const(String),
    Var(String),
}

/// DO block variants.
#[derive(Debug, Clone)]
pub struct DoBlock {
    pub kind: DoKind,
    pub body: Vec<Clause>,
    /// Control variable name, targeted by `LEAVE name` / `ITERATE name`.
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DoKind {
    /// DO; ... END (simple grouping)
    Simple,
    /// DO FOREVER; ... END
    Forever,
    /// DO expr; ... END (counted loop)
    Count(Expr),
    /// DO WHILE expr; ... END
    While(Expr),
    /// DO UNTIL expr; ... END
    Until(Expr),
    /// DO var = start TO end [BY step] [FOR count]; ... END
    Controlled(Box<ControlledLoop>),
    /// DO var OVER collection; ... END
    Over { var: String, collection: Expr },
}

/// Controlled DO loop parameters.
#[derive(Debug, Clone)]
pub struct ControlledLoop {
    pub var: String,
    pub start: Expr,
    pub to: Option<Expr>,
    pub by: Option<Expr>,
    pub r#for: Option<Expr>,
    pub while_cond: Option<Expr>,
    pub until_cond: Option<Expr>,
}

/// PARSE sources.
#[derive(Debug, Clone)]
pub enum ParseSource {
    /// PARSE ARG: routine arguments
    Arg,
    /// PARSE VALUE expr WITH: expression result
    Value(Expr),
    /// PARSE VAR name: variable contents
    Var(String),
}

/// PARSE template: a sequence of targets and patterns.
#[derive(Debug, Clone, Default)]
pub struct ParseTemplate {
    pub elements: Vec<TemplateElement>,
}

#[derive(Debug, Clone)]
pub enum TemplateElement {
    /// A variable name to receive data.
    Variable(String),
    /// A literal string pattern to match.
    Literal(String),
    /// An absolute column position.
    AbsolutePos(Expr),
    /// A relative column position (+ or -).
    RelativePos(i32),
    /// `(name)`: a variable holding a pattern string.
    VariablePattern(String),
    /// The dot placeholder (discard data).
    Dot,
    /// Comma separating multiple argument strings.
    Comma,
}

/// SIGNAL variants.
#[derive(Debug, Clone)]
pub enum SignalAction {
    /// SIGNAL label
    Label(String),
    /// SIGNAL VALUE expr
    Value(Expr),
    /// SIGNAL ON condition [NAME label]
    On {
        condition: Condition,
        name: Option<String>,
    },
    /// SIGNAL OFF condition
    Off(Condition),
}

/// Trappable conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Error,
    Failure,
    NoValue,
    Syntax,
}

impl Condition {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "ERROR" => Some(Self::Error),
            "FAILURE" => Some(Self::Failure),
            "NOVALUE" => Some(Self::NoValue),
            "SYNTAX" => Some(Self::Syntax),
            _ => None,
        }
    }

    /// The condition name, which is also the default trap label.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Failure => "FAILURE",
            Self::NoValue => "NOVALUE",
            Self::Syntax => "SYNTAX",
        }
    }
}

/// NUMERIC instruction settings.
#[derive(Debug, Clone)]
pub enum NumericSetting {
    Digits(Option<Expr>),
    Form(NumericFormSetting),
    Fuzz(Option<Expr>),
}

#[derive(Debug, Clone)]
pub enum NumericFormSetting {
    Scientific,
    Engineering,
    Value(Expr),
}

/// ADDRESS instruction actions.
#[derive(Debug, Clone)]
pub enum AddressAction {
    /// ADDRESS environment: set default (empty name swaps with previous)
    SetEnvironment(String),
    /// ADDRESS environment command: one-shot
    Temporary { environment: String, command: Expr },
    /// ADDRESS VALUE expr: dynamic environment name
    Value(Expr),
}

/// Expressions.
#[derive(Debug, Clone)]
pub enum Expr {
    /// String literal (quoted or HEREDOC)
    StringLit(String),
    /// Number literal (kept as written; coerced lazily)
    Number(String),
    /// Variable reference
    Symbol(String),
    /// Compound variable: stem.tail
    Compound {
        stem: String,
        tail: Vec<TailElement>,
    },
    /// Binary operation
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    /// Unary prefix operation
    UnaryOp { op: UnaryOp, operand: Box<Expr> },
    /// Function call: name(args)
    FunctionCall { name: String, args: Vec<Expr> },
    /// Parenthesized expression
    Paren(Box<Expr>),
    /// `value |> stage`. Chains nest to the right: `a |> f |> g` is
    /// `Pipe(a, Pipe(f, g))`.
    Pipe { value: Box<Expr>, stage: Box<Expr> },
    /// `[a, b, c]`
    ArrayLit(Vec<Expr>),
    /// `{key: value, ...}` with keys in source order
    ObjectLit(Vec<(String, Expr)>),
}

impl Expr {
    /// Flatten a right-nested pipe chain into `(head, stages)` in
    /// left-to-right application order.
    pub fn pipe_chain(&self) -> (&Expr, Vec<&Expr>) {
        let mut stages = Vec::new();
        let Self::Pipe { value, stage } = self else {
            return (self, stages);
        };
        let mut rest: &Expr = stage;
        while let Self::Pipe { value: next, stage: tail } = rest {
            stages.push(&**next);
            rest = &**tail;
        }
        stages.push(rest);
        (&**value, stages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Remainder,
    Power,
    Concat,      // abuttal or ||
    ConcatBlank, // implicit blank concatenation

    // Comparison
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    StrictEq,
    StrictNotEq,
    StrictGt,
    StrictLt,
    StrictGtEq,
    StrictLtEq,

    // Logical
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Expr {
        Expr::Symbol(name.into())
    }

    #[test]
    fn pipe_chain_flattens_right_nesting() {
        let expr = Expr::Pipe {
            value: Box::new(Expr::StringLit("5".into())),
            stage: Box::new(Expr::Pipe {
                value: Box::new(sym("DOUBLE")),
                stage: Box::new(sym("TRIPLE")),
            }),
        };
        let (head, stages) = expr.pipe_chain();
        assert!(matches!(head, Expr::StringLit(s) if s == "5"));
        let names: Vec<_> = stages
            .iter()
            .map(|s| match s {
                Expr::Symbol(n) => n.as_str(),
                _ => "?",
            })
            .collect();
        assert_eq!(names, ["DOUBLE", "TRIPLE"]);
    }

    #[test]
    fn non_pipe_has_no_stages() {
        let expr = sym("X");
        let (head, stages) = expr.pipe_chain();
        assert!(matches!(head, Expr::Symbol(_)));
        assert!(stages.is_empty());
    }
}
