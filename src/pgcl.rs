//! pGCL surface syntax
//!
//! A small hand-rolled lexer and recursive-descent parser for the guarded
//! command language the checkers consume: `nat` declarations, one `while`
//! loop, `if`/probabilistic-choice/assignment/`skip`/`tick` statements, and
//! expectation expressions with Iverson brackets and a standalone `\infty`
//! literal. `#` and `//` start line comments. Probabilities and decimal
//! literals are kept exact as rationals.
//!
//! Also hosts the input checks the rest of the pipeline relies on: the
//! program must be exactly one loop with a loop-free body and no leading
//! assignments, every declared variable must be `nat`, and linearity of
//! programs and expectations decides which solver logic is requested.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use smol_str::SmolStr;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Declared variable type. Only `nat` survives the input checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarType {
    Nat,
    Bool,
    Real,
}

/// Binary operators of the surface syntax.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Le,
    Lt,
    Add,
    Sub,
    Mul,
    Div,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    /// Iverson bracket `[g]`.
    Iverson,
}

/// Expressions (shared between guards, arithmetic and expectations).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    BoolLit(bool),
    NatLit(BigInt),
    RealLit(BigRational),
    /// The `\infty` literal; only legal as a whole summand.
    Infinity,
    Var(SmolStr),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Constant value, if the expression is a numeric literal.
    pub fn constant(&self) -> Option<BigRational> {
        match self {
            Expr::NatLit(n) => Some(BigRational::from_integer(n.clone())),
            Expr::RealLit(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// Whether any program variable occurs in the expression.
    pub fn mentions_variable(&self) -> bool {
        match self {
            Expr::Var(_) => true,
            Expr::Unary(_, inner) => inner.mentions_variable(),
            Expr::Binary(_, lhs, rhs) => lhs.mentions_variable() || rhs.mentions_variable(),
            _ => false,
        }
    }
}

/// Statements.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Skip,
    Assign(SmolStr, Expr),
    /// `{lhs} [prob] {rhs}` — probabilistic choice with constant probability.
    Choice(Vec<Instr>, BigRational, Vec<Instr>),
    If(Expr, Vec<Instr>, Vec<Instr>),
    While(Expr, Vec<Instr>),
    Tick(Expr),
}

/// A parsed program: declarations followed by instructions.
#[derive(Clone, Debug)]
pub struct Program {
    pub declarations: Vec<(SmolStr, VarType)>,
    pub instructions: Vec<Instr>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Syntax errors with a source line.
#[derive(Debug, thiserror::Error)]
#[error("parse error at line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

/// Input rejections: syntactically valid programs the checkers do not handle.
#[derive(Debug, thiserror::Error)]
pub enum RejectError {
    #[error("the program is not one big loop with a loop-free body")]
    NotOneBigLoop,
    #[error("nested loops are not supported")]
    NestedLoop,
    #[error("variable `{0}` is not of type nat; only nat variables are supported")]
    UnsupportedVariableType(String),
    #[error("tick(..) takes a numeric literal only")]
    NonLiteralTick,
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(SmolStr),
    Nat(BigInt),
    Decimal(BigRational),
    Infinity,
    ColonEq,
    LessEq,
    Less,
    Equals,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Amp,
    PipePipe,
}

fn lex(src: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let mut toks = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line = 1usize;
    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    while let Some(&c) = chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        chars.next();
                    }
                } else {
                    toks.push((Tok::Slash, line));
                }
            }
            '\\' => {
                chars.next();
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphabetic() {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if word == "infty" {
                    toks.push((Tok::Infinity, line));
                } else {
                    return Err(ParseError { line, message: format!("unknown literal \\{word}") });
                }
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'.') {
                    chars.next();
                    let mut frac = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_digit() {
                            frac.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if frac.is_empty() {
                        return Err(ParseError {
                            line,
                            message: "digits expected after decimal point".into(),
                        });
                    }
                    let numer: BigInt = format!("{digits}{frac}").parse().expect("digit string");
                    let denom = num_traits::pow(BigInt::from(10), frac.len());
                    toks.push((Tok::Decimal(BigRational::new(numer, denom)), line));
                } else {
                    toks.push((Tok::Nat(digits.parse().expect("digit string")), line));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push((Tok::Ident(SmolStr::new(word)), line));
            }
            ':' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    toks.push((Tok::ColonEq, line));
                } else {
                    return Err(ParseError { line, message: "expected `:=`".into() });
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    toks.push((Tok::LessEq, line));
                } else {
                    toks.push((Tok::Less, line));
                }
            }
            '=' => {
                chars.next();
                toks.push((Tok::Equals, line));
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    toks.push((Tok::PipePipe, line));
                } else {
                    return Err(ParseError { line, message: "expected `||`".into() });
                }
            }
            '&' => {
                chars.next();
                toks.push((Tok::Amp, line));
            }
            '+' => {
                chars.next();
                toks.push((Tok::Plus, line));
            }
            '-' => {
                chars.next();
                toks.push((Tok::Minus, line));
            }
            '*' => {
                chars.next();
                toks.push((Tok::Star, line));
            }
            '(' => {
                chars.next();
                toks.push((Tok::LParen, line));
            }
            ')' => {
                chars.next();
                toks.push((Tok::RParen, line));
            }
            '{' => {
                chars.next();
                toks.push((Tok::LBrace, line));
            }
            '}' => {
                chars.next();
                toks.push((Tok::RBrace, line));
            }
            '[' => {
                chars.next();
                toks.push((Tok::LBracket, line));
            }
            ']' => {
                chars.next();
                toks.push((Tok::RBracket, line));
            }
            ';' => {
                chars.next();
                toks.push((Tok::Semi, line));
            }
            other => {
                return Err(ParseError { line, message: format!("unexpected character `{other}`") })
            }
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map(|(_, l)| *l)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError { line: self.line(), message: message.into() }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), ParseError> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            _ => Err(ParseError { line: self.line(), message: format!("expected {what}") }),
        }
    }

    fn eat_semis(&mut self) {
        while self.peek() == Some(&Tok::Semi) {
            self.pos += 1;
        }
    }

    fn ident_is(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(w)) if w == word)
    }

    // -- programs ----------------------------------------------------------

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut declarations = Vec::new();
        loop {
            let ty = match self.peek() {
                Some(Tok::Ident(w)) if w == "nat" => VarType::Nat,
                Some(Tok::Ident(w)) if w == "bool" => VarType::Bool,
                Some(Tok::Ident(w)) if w == "real" || w == "float" => VarType::Real,
                _ => break,
            };
            self.pos += 1;
            let name = match self.next() {
                Some(Tok::Ident(name)) => name,
                _ => return Err(self.error("expected variable name in declaration")),
            };
            self.expect(Tok::Semi, "`;` after declaration")?;
            declarations.push((name, ty));
        }
        let instructions = self.instructions(false)?;
        if self.peek().is_some() {
            return Err(self.error("trailing input after program"));
        }
        Ok(Program { declarations, instructions })
    }

    fn instructions(&mut self, inside_block: bool) -> Result<Vec<Instr>, ParseError> {
        let mut instrs = Vec::new();
        loop {
            self.eat_semis();
            match self.peek() {
                None => break,
                Some(Tok::RBrace) if inside_block => break,
                _ => instrs.push(self.instr()?),
            }
        }
        Ok(instrs)
    }

    fn block(&mut self) -> Result<Vec<Instr>, ParseError> {
        self.expect(Tok::LBrace, "`{`")?;
        let instrs = self.instructions(true)?;
        self.expect(Tok::RBrace, "`}`")?;
        Ok(instrs)
    }

    fn instr(&mut self) -> Result<Instr, ParseError> {
        match self.peek() {
            Some(Tok::LBrace) => {
                let lhs = self.block()?;
                self.expect(Tok::LBracket, "`[` probability")?;
                let prob = self.expr()?;
                self.expect(Tok::RBracket, "`]` after probability")?;
                let rhs = self.block()?;
                let prob = eval_probability(&prob)
                    .ok_or_else(|| self.error("probability must be a constant in [0, 1]"))?;
                Ok(Instr::Choice(lhs, prob, rhs))
            }
            Some(Tok::Ident(w)) if w == "while" => {
                self.pos += 1;
                self.expect(Tok::LParen, "`(` after while")?;
                let guard = self.expr()?;
                self.expect(Tok::RParen, "`)` after loop guard")?;
                let body = self.block()?;
                Ok(Instr::While(guard, body))
            }
            Some(Tok::Ident(w)) if w == "if" => {
                self.pos += 1;
                self.expect(Tok::LParen, "`(` after if")?;
                let cond = self.expr()?;
                self.expect(Tok::RParen, "`)` after condition")?;
                let then_branch = self.block()?;
                let else_branch =
                    if self.peek() == Some(&Tok::LBrace) { self.block()? } else { Vec::new() };
                Ok(Instr::If(cond, then_branch, else_branch))
            }
            Some(Tok::Ident(w)) if w == "skip" => {
                self.pos += 1;
                Ok(Instr::Skip)
            }
            Some(Tok::Ident(w)) if w == "tick" => {
                self.pos += 1;
                self.expect(Tok::LParen, "`(` after tick")?;
                let amount = self.expr()?;
                self.expect(Tok::RParen, "`)` after tick amount")?;
                Ok(Instr::Tick(amount))
            }
            Some(Tok::Ident(_)) => {
                let name = match self.next() {
                    Some(Tok::Ident(name)) => name,
                    _ => unreachable!("peeked an identifier"),
                };
                self.expect(Tok::ColonEq, "`:=` in assignment")?;
                let value = self.expr()?;
                Ok(Instr::Assign(name, value))
            }
            _ => Err(self.error("expected a statement")),
        }
    }

    // -- expressions -------------------------------------------------------

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Tok::PipePipe) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.cmp_expr()?;
        while self.peek() == Some(&Tok::Amp) {
            self.pos += 1;
            let rhs = self.cmp_expr()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Tok::LessEq) => BinOp::Le,
            Some(Tok::Less) => BinOp::Lt,
            Some(Tok::Equals) => BinOp::Eq,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn add_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.mul_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            // Constant division folds immediately; anything else stays a
            // division node for the linearity check to flag.
            if op == BinOp::Div {
                if let (Some(a), Some(b)) = (lhs.constant(), rhs.constant()) {
                    if b.is_zero() {
                        return Err(self.error("division by zero"));
                    }
                    lhs = Expr::RealLit(a / b);
                    continue;
                }
            }
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.ident_is("not") {
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let inner = self.expr()?;
                self.expect(Tok::RBracket, "`]` after Iverson bracket")?;
                Ok(Expr::Unary(UnOp::Iverson, Box::new(inner)))
            }
            Some(Tok::Nat(n)) => Ok(Expr::NatLit(n)),
            Some(Tok::Decimal(r)) => Ok(Expr::RealLit(r)),
            Some(Tok::Infinity) => Ok(Expr::Infinity),
            Some(Tok::Ident(w)) if w == "true" || w == "True" => Ok(Expr::BoolLit(true)),
            Some(Tok::Ident(w)) if w == "false" || w == "False" => Ok(Expr::BoolLit(false)),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            _ => Err(self.error("expected an expression")),
        }
    }
}

fn eval_probability(expr: &Expr) -> Option<BigRational> {
    let value = expr.constant()?;
    if value < BigRational::zero() || value > BigRational::from_integer(1.into()) {
        return None;
    }
    Some(value)
}

/// Parse a whole program.
pub fn parse_program(src: &str) -> Result<Program, ParseError> {
    let toks = lex(src)?;
    Parser { toks, pos: 0 }.program()
}

/// Parse a standalone expectation expression.
pub fn parse_expectation(src: &str) -> Result<Expr, ParseError> {
    let toks = lex(src)?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.expr()?;
    if parser.peek().is_some() {
        return Err(parser.error("trailing input after expectation"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Input checks
// ---------------------------------------------------------------------------

/// The single top-level loop of the program: `(guard, body)`.
///
/// Rejects initialization assignments before the loop, anything after it,
/// and loops anywhere inside the body.
pub fn one_big_loop(program: &Program) -> Result<(&Expr, &[Instr]), RejectError> {
    match program.instructions.as_slice() {
        [Instr::While(guard, body)] => {
            if contains_loop(body) {
                return Err(RejectError::NestedLoop);
            }
            Ok((guard, body))
        }
        _ => Err(RejectError::NotOneBigLoop),
    }
}

fn contains_loop(instrs: &[Instr]) -> bool {
    instrs.iter().any(|instr| match instr {
        Instr::While(_, _) => true,
        Instr::If(_, t, e) => contains_loop(t) || contains_loop(e),
        Instr::Choice(l, _, r) => contains_loop(l) || contains_loop(r),
        _ => false,
    })
}

/// Reject any declaration that is not `nat`.
pub fn check_nat_declarations(program: &Program) -> Result<(), RejectError> {
    for (name, ty) in &program.declarations {
        if *ty != VarType::Nat {
            return Err(RejectError::UnsupportedVariableType(name.to_string()));
        }
    }
    Ok(())
}

/// Linearity of every expression in the program.
pub fn program_is_linear(program: &Program) -> bool {
    fn instrs_linear(instrs: &[Instr]) -> bool {
        instrs.iter().all(|instr| match instr {
            Instr::Skip => true,
            Instr::Assign(_, e) | Instr::Tick(e) => expr_is_linear(e),
            Instr::Choice(l, _, r) => instrs_linear(l) && instrs_linear(r),
            Instr::If(c, t, e) => expr_is_linear(c) && instrs_linear(t) && instrs_linear(e),
            Instr::While(g, body) => expr_is_linear(g) && instrs_linear(body),
        })
    }
    instrs_linear(&program.instructions)
}

/// Linearity of a single expression: products may mention variables on at
/// most one side; surviving division nodes are non-linear.
pub fn expr_is_linear(expr: &Expr) -> bool {
    match expr {
        Expr::Binary(BinOp::Mul, lhs, rhs) => {
            expr_is_linear(lhs)
                && expr_is_linear(rhs)
                && !(lhs.mentions_variable() && rhs.mentions_variable())
        }
        Expr::Binary(BinOp::Div, _, _) => false,
        Expr::Binary(_, lhs, rhs) => expr_is_linear(lhs) && expr_is_linear(rhs),
        Expr::Unary(_, inner) => expr_is_linear(inner),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEO: &str = "
        nat c;
        nat f;

        while (f = 1) {
            { f := 0 } [0.5] { c := c + 1 }
        }
    ";

    #[test]
    fn parses_the_geometric_loop() {
        let program = parse_program(GEO).expect("parse");
        assert_eq!(program.declarations.len(), 2);
        let (guard, body) = one_big_loop(&program).expect("one loop");
        assert_eq!(
            *guard,
            Expr::Binary(
                BinOp::Eq,
                Box::new(Expr::Var("f".into())),
                Box::new(Expr::NatLit(1.into()))
            )
        );
        assert_eq!(body.len(), 1);
        match &body[0] {
            Instr::Choice(lhs, prob, rhs) => {
                assert_eq!(prob, &BigRational::new(1.into(), 2.into()));
                assert_eq!(lhs.len(), 1);
                assert_eq!(rhs.len(), 1);
            }
            other => panic!("expected a probabilistic choice, got {other:?}"),
        }
    }

    #[test]
    fn comments_and_flexible_semicolons_are_accepted() {
        let src = "
            # leading comment
            nat x; // trailing comment style
            while (0 < x) {
                x := x - 1;;
                skip
            }
        ";
        let program = parse_program(src).expect("parse");
        assert_eq!(program.declarations.len(), 1);
        assert!(one_big_loop(&program).is_ok());
    }

    #[test]
    fn folds_constant_division_exactly() {
        let e = parse_expectation("1/3").expect("parse");
        assert_eq!(e, Expr::RealLit(BigRational::new(1.into(), 3.into())));
    }

    #[test]
    fn decimal_literals_are_exact() {
        let e = parse_expectation("0.99").expect("parse");
        assert_eq!(e, Expr::RealLit(BigRational::new(99.into(), 100.into())));
    }

    #[test]
    fn parses_iverson_expectations() {
        let e = parse_expectation("[f=1]*(c+1) + [not (f=1)]*c").expect("parse");
        match e {
            Expr::Binary(BinOp::Add, _, _) => {}
            other => panic!("expected a sum, got {other:?}"),
        }
    }

    #[test]
    fn rejects_programs_with_initialization() {
        let src = "
            nat x;
            x := 5;
            while (0 < x) { x := x - 1 }
        ";
        let program = parse_program(src).expect("parse");
        assert!(matches!(one_big_loop(&program), Err(RejectError::NotOneBigLoop)));
    }

    #[test]
    fn rejects_nested_loops() {
        let src = "
            nat x;
            while (0 < x) {
                while (1 < x) { x := x - 1 }
            }
        ";
        let program = parse_program(src).expect("parse");
        assert!(matches!(one_big_loop(&program), Err(RejectError::NestedLoop)));
    }

    #[test]
    fn rejects_non_nat_declarations() {
        let src = "
            bool b;
            while (b = 1) { skip }
        ";
        let program = parse_program(src).expect("parse");
        assert!(matches!(
            check_nat_declarations(&program),
            Err(RejectError::UnsupportedVariableType(_))
        ));
    }

    #[test]
    fn variable_products_are_non_linear() {
        assert!(!expr_is_linear(&parse_expectation("x*y").unwrap()));
        assert!(expr_is_linear(&parse_expectation("2*y + x").unwrap()));
        assert!(expr_is_linear(&parse_expectation("0.35*0.4*(toSend+1)").unwrap()));
    }

    #[test]
    fn probability_out_of_range_is_rejected() {
        let src = "
            nat x;
            while (0 < x) { { skip } [1.5] { skip } }
        ";
        assert!(parse_program(src).is_err());
    }
}
