use thiserror::Error;
use tracing::{debug, trace};

use super::lexer::{self, LexError, Token, TokenKind};
use super::Inspect;
use crate::memory::MemoryError;
use crate::processor::{RegisterName, UnknownRegister};
use crate::Address;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("empty expression")]
    Empty,
    #[error("missing operand between tokens {p} and {q}")]
    EmptyRange { p: usize, q: usize },
    #[error("`{0}` is not a value")]
    NotAValue(String),
    #[error(transparent)]
    UnknownRegister(#[from] UnknownRegister),
    #[error("literal `{0}` does not fit in 32 bits")]
    LiteralOutOfRange(String),
    #[error("dereference needs a register operand, found `{0}`")]
    DerefOperand(String),
    #[error("no operator joins tokens {p}..={q}")]
    MissingOperator { p: usize, q: usize },
    #[error("operator `{operator}` at token {position} has no valid operand here")]
    MisplacedOperator {
        operator: &'static str,
        position: usize,
    },
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot dereference: {0}")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Operator classes, weakest binding last. The dominant operator of a range is the one in
/// the greatest class, so `&&` splits before `||`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Dominance {
    Unary,
    Multiplicative,
    Additive,
    Equality,
    LogicalOr,
    LogicalAnd,
}

fn binary_class(kind: TokenKind) -> Option<Dominance> {
    use TokenKind::*;

    match kind {
        Star | Slash => Some(Dominance::Multiplicative),
        Plus | Minus => Some(Dominance::Additive),
        Equal | NotEqual => Some(Dominance::Equality),
        Or => Some(Dominance::LogicalOr),
        And => Some(Dominance::LogicalAnd),
        _ => None,
    }
}

fn truth(condition: bool) -> i32 {
    condition as i32
}

/// Tokenizes, disambiguates and evaluates `text` against the current machine state.
pub fn evaluate<S: Inspect + ?Sized>(text: &str, state: &S) -> Result<i32, ExprError> {
    let mut tokens = lexer::tokenize(text)?;
    lexer::disambiguate(&mut tokens);
    trace!(?tokens, "tokenized expression");

    if tokens.is_empty() {
        return Err(EvalError::Empty.into());
    }
    check_balanced(&tokens)?;

    let value = eval(&tokens, 0, tokens.len() - 1, state)?;
    debug!(expression = text, value, "evaluated expression");
    Ok(value)
}

/// Evaluates the inclusive token range `[p, q]` of an already disambiguated sequence.
pub fn eval<S: Inspect + ?Sized>(
    tokens: &[Token],
    p: usize,
    q: usize,
    state: &S,
) -> Result<i32, EvalError> {
    Evaluator { tokens, state }.eval(p, q)
}

fn check_balanced(tokens: &[Token]) -> Result<(), EvalError> {
    let mut depth = 0usize;
    for token in tokens {
        match token.kind {
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen => {
                depth = depth
                    .checked_sub(1)
                    .ok_or(EvalError::UnbalancedParentheses)?
            }
            _ => {}
        }
    }
    if depth == 0 {
        Ok(())
    } else {
        Err(EvalError::UnbalancedParentheses)
    }
}

struct Evaluator<'a, S: ?Sized> {
    tokens: &'a [Token],
    state: &'a S,
}

impl<'a, S: Inspect + ?Sized> Evaluator<'a, S> {
    fn eval(&self, p: usize, q: usize) -> Result<i32, EvalError> {
        use TokenKind::*;

        if p > q {
            return Err(EvalError::EmptyRange { p, q });
        }
        if p == q {
            return self.leaf(p);
        }

        let (first, last) = (&self.tokens[p], &self.tokens[q]);
        if p + 1 == q && matches!(last.kind, Decimal | Hex | Register) {
            match first.kind {
                Negate => return Ok(self.leaf(q)?.wrapping_neg()),
                Deref if last.kind == Register => return self.deref(self.leaf(q)?),
                Deref => return Err(EvalError::DerefOperand(last.to_string())),
                _ => {}
            }
        }

        if self.is_parenthesized(p, q) {
            return self.eval(p + 1, q - 1);
        }

        let op = self.dominant_operator(p, q)?;
        let operator = self.tokens[op].kind;
        let misplaced = EvalError::MisplacedOperator {
            operator: operator.symbol(),
            position: op,
        };

        if op == p {
            let value = self.eval(p + 1, q)?;
            return match operator {
                Not => Ok(truth(value == 0)),
                Negate => Ok(value.wrapping_neg()),
                Deref => self.deref(value),
                _ => Err(misplaced),
            };
        }

        if binary_class(operator).is_none() {
            return Err(misplaced);
        }
        let lhs = self.eval(p, op - 1)?;
        let rhs = self.eval(op + 1, q)?;
        match operator {
            Plus => Ok(lhs.wrapping_add(rhs)),
            Minus => Ok(lhs.wrapping_sub(rhs)),
            Star => Ok(lhs.wrapping_mul(rhs)),
            Slash if rhs == 0 => Err(EvalError::DivisionByZero),
            Slash => Ok(lhs.wrapping_div(rhs)),
            Equal => Ok(truth(lhs == rhs)),
            NotEqual => Ok(truth(lhs != rhs)),
            And => Ok(truth(lhs != 0 && rhs != 0)),
            Or => Ok(truth(lhs != 0 || rhs != 0)),
            _ => Err(misplaced),
        }
    }

    fn leaf(&self, index: usize) -> Result<i32, EvalError> {
        let token = &self.tokens[index];
        match token.kind {
            TokenKind::Decimal => parse_literal(&token.text, &token.text, 10),
            TokenKind::Hex => parse_literal(&token.text, &token.text[2..], 16),
            TokenKind::Register => {
                let name: RegisterName = token.text.parse()?;
                Ok(self.state.register(name) as i32)
            }
            _ => Err(EvalError::NotAValue(token.to_string())),
        }
    }

    fn deref(&self, address: i32) -> Result<i32, EvalError> {
        Ok(self.state.read_byte(address as Address)? as i32)
    }

    fn is_parenthesized(&self, p: usize, q: usize) -> bool {
        if self.tokens[p].kind != TokenKind::LeftParen || self.tokens[q].kind != TokenKind::RightParen
        {
            return false;
        }
        let mut depth = 0usize;
        for token in &self.tokens[p + 1..q] {
            match token.kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => match depth.checked_sub(1) {
                    Some(next) => depth = next,
                    None => return false,
                },
                _ => {}
            }
        }
        depth == 0
    }

    /// Index of the `)` closing the group opened at `open`, without looking past `q`.
    fn closing_paren(&self, open: usize, q: usize) -> Result<usize, EvalError> {
        let mut depth = 0usize;
        for index in open..=q {
            match self.tokens[index].kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(index);
                    }
                }
                _ => {}
            }
        }
        Err(EvalError::UnbalancedParentheses)
    }

    /// Picks the operator that splits `[p, q]` at the top level. Parenthesized groups are
    /// skipped whole. Binary classes keep their rightmost member, the prefix class its
    /// leftmost, and a dereference is only chosen while nothing else has been seen.
    fn dominant_operator(&self, p: usize, q: usize) -> Result<usize, EvalError> {
        use TokenKind::*;

        let mut op = None;
        let mut level: Option<Dominance> = None;
        let mut index = p;
        while index <= q {
            let kind = self.tokens[index].kind;
            match kind {
                LeftParen => index = self.closing_paren(index, q)?,
                RightParen => return Err(EvalError::UnbalancedParentheses),
                Deref => {
                    if level.is_none() {
                        op = Some(index);
                    }
                }
                Negate | Not => {
                    if level.is_none() {
                        op = Some(index);
                        level = Some(Dominance::Unary);
                    }
                }
                _ => {
                    if let Some(class) = binary_class(kind) {
                        if level <= Some(class) {
                            op = Some(index);
                            level = Some(class);
                        }
                    }
                }
            }
            index += 1;
        }
        op.ok_or(EvalError::MissingOperator { p, q })
    }
}

fn parse_literal(text: &str, digits: &str, radix: u32) -> Result<i32, EvalError> {
    if digits.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(digits, radix)
        .map(|value| value as i32)
        .map_err(|_| EvalError::LiteralOutOfRange(text.to_owned()))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::memory::{Memory, MemoryError};

    /// A register file and a small memory window for exercising expressions.
    #[derive(Default)]
    pub(crate) struct FakeState {
        pub registers: HashMap<String, u32>,
        pub memory: Vec<u8>,
        pub eip: u32,
    }

    impl FakeState {
        pub(crate) fn with_register(mut self, name: &str, value: u32) -> Self {
            self.registers.insert(name.to_owned(), value);
            self
        }

        pub(crate) fn with_memory(mut self, bytes: &[u8]) -> Self {
            self.memory = bytes.to_vec();
            self
        }
    }

    impl Inspect for FakeState {
        fn register(&self, name: RegisterName) -> u32 {
            let full = |long: &str| self.registers.get(long).copied().unwrap_or(0);
            match name {
                RegisterName::Eip => self.eip,
                RegisterName::Long(gpr) => full(gpr.long_name()),
                RegisterName::Word(gpr) => full(gpr.long_name()) & 0xFFFF,
                RegisterName::Byte(_) => {
                    let text = name.to_string();
                    let long = format!("e{}x", &text[..1]);
                    let value = full(&long);
                    if text.ends_with('h') {
                        (value >> 8) & 0xFF
                    } else {
                        value & 0xFF
                    }
                }
            }
        }

        fn read_byte(&self, address: Address) -> Result<u8, MemoryError> {
            self.memory
                .get(address as usize)
                .copied()
                .ok_or(MemoryError::OutOfBounds { address, len: 1 })
        }
    }

    fn value(text: &str) -> i32 {
        evaluate(text, &FakeState::default()).unwrap()
    }

    fn error(text: &str) -> ExprError {
        evaluate(text, &FakeState::default()).unwrap_err()
    }

    #[test]
    fn literals() {
        assert_eq!(value("0x0"), 0);
        assert_eq!(value("0x1A"), 26);
        assert_eq!(value("0xff"), 255);
        assert_eq!(value("123"), 123);
        assert_eq!(value("0xFFFFFFFF"), -1);
        assert_eq!(value("0x"), 0);
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(value("2+3*4"), 14);
        assert_eq!(value("(2+3)*4"), 20);
        assert_eq!(value("10/3"), 3);
        assert_eq!(value("10 - 4 - 3"), 3);
        assert_eq!(value("64 / 4 / 2"), 8);
        assert_eq!(value("2 * (3 + 4) * 5"), 70);
        assert_eq!(value("((7))"), 7);
    }

    #[test]
    fn negation() {
        assert_eq!(value("-5"), -5);
        assert_eq!(value("5-3"), 2);
        assert_eq!(value("- -5"), 5);
        assert_eq!(value("-0x10"), -16);
        assert_eq!(value("2*-3"), -6);
        assert_eq!(value("-(1+2)"), -3);
        assert_eq!(value("-2*3"), -6);
    }

    #[test]
    fn comparison_and_logic_yield_truth_values() {
        assert_eq!(value("1 == 1"), 1);
        assert_eq!(value("1 != 1"), 0);
        assert_eq!(value("!0"), 1);
        assert_eq!(value("!7"), 0);
        assert_eq!(value("!0 + 1"), 2);
        assert_eq!(value("3 && 4"), 1);
        assert_eq!(value("0 || 0"), 0);
        assert_eq!(value("1 + 1 == 2"), 1);
    }

    #[test]
    fn logical_and_splits_before_logical_or() {
        // (1 || 0) && 0, not 1 || (0 && 0)
        assert_eq!(value("1 || 0 && 0"), 0);
        assert_eq!(value("0 && 0 || 1"), 0);
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(value("0x7FFFFFFF + 1"), i32::MIN);
        assert_eq!(value("0x80000000 / -1"), i32::MIN);
        assert_eq!(value("-0x80000000"), i32::MIN);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(error("1 / 0"), ExprError::Eval(EvalError::DivisionByZero));
        assert_eq!(error("1 / (2 - 2)"), ExprError::Eval(EvalError::DivisionByZero));
    }

    #[test]
    fn registers_and_dereference() {
        let state = FakeState::default()
            .with_register("eax", 5)
            .with_register("ebx", 0x1234_ABCD)
            .with_memory(&[0, 1, 2, 3, 4, 0x99, 6]);
        let eval = |text| evaluate(text, &state).unwrap();

        assert_eq!(eval("$eax"), 5);
        assert_eq!(eval("*$eax"), 0x99);
        assert_eq!(eval("$bx"), 0xABCD);
        assert_eq!(eval("$bl"), 0xCD);
        assert_eq!(eval("$bh"), 0xAB);
        assert_eq!(eval("$eax-1"), 4);
        assert_eq!(eval("$eax*2"), 10);
        assert_eq!(eval("*($eax + 1)"), 6);
        assert_eq!(eval("*$eax + 1"), 0x9A);
        assert_eq!(eval("-$eax"), -5);
        assert_eq!(eval("!*$eax"), 0);
        assert_eq!(eval("$eax == 5 && *$eax == 0x99"), 1);
    }

    #[test]
    fn eip_is_readable() {
        let state = FakeState {
            eip: 0x100000,
            ..FakeState::default()
        };
        assert_eq!(evaluate("$eip", &state), Ok(0x100000));
    }

    #[test]
    fn dereference_outside_memory_is_an_error() {
        let state = FakeState::default().with_register("eax", 100);
        assert_eq!(
            evaluate("*$eax", &state),
            Err(ExprError::Eval(EvalError::Memory(MemoryError::OutOfBounds {
                address: 100,
                len: 1
            })))
        );
    }

    #[test]
    fn dereference_of_a_literal_needs_parentheses() {
        let state = FakeState::default().with_memory(&[7, 8]);
        assert_eq!(
            evaluate("*1", &state),
            Err(ExprError::Eval(EvalError::DerefOperand("1".to_owned())))
        );
        assert_eq!(evaluate("*(1)", &state), Ok(8));
    }

    #[test]
    fn malformed_expressions_are_errors_not_panics() {
        assert_eq!(error(""), ExprError::Eval(EvalError::Empty));
        assert_eq!(error("1 2"), ExprError::Eval(EvalError::MissingOperator { p: 0, q: 1 }));
        assert_eq!(error("(1"), ExprError::Eval(EvalError::UnbalancedParentheses));
        assert_eq!(error("1)"), ExprError::Eval(EvalError::UnbalancedParentheses));
        assert_eq!(error("()"), ExprError::Eval(EvalError::EmptyRange { p: 1, q: 0 }));
        assert_eq!(error("1 +"), ExprError::Eval(EvalError::EmptyRange { p: 2, q: 1 }));
        assert_eq!(
            error("+1"),
            ExprError::Eval(EvalError::MisplacedOperator {
                operator: "+",
                position: 0
            })
        );
        assert_eq!(
            error("1 ! 2"),
            ExprError::Eval(EvalError::MisplacedOperator {
                operator: "!",
                position: 1
            })
        );
        assert_eq!(error("(1)(2)"), ExprError::Eval(EvalError::MissingOperator { p: 0, q: 5 }));
        assert_eq!(
            error("99999999999"),
            ExprError::Eval(EvalError::LiteralOutOfRange("99999999999".to_owned()))
        );
        assert_eq!(error("1 # 2"), ExprError::Lex(LexError::NoMatch { position: 2 }));
    }

    #[test]
    fn eval_works_on_sub_ranges() {
        let mut tokens = lexer::tokenize("1 + 2 * 3").unwrap();
        lexer::disambiguate(&mut tokens);
        let state = FakeState::default();
        assert_eq!(eval(&tokens, 2, 4, &state), Ok(6));
        assert_eq!(eval(&tokens, 0, 0, &state), Ok(1));
        assert_eq!(eval(&tokens, 3, 2, &state), Err(EvalError::EmptyRange { p: 3, q: 2 }));
        assert_eq!(
            eval(&tokens, 1, 1, &state),
            Err(EvalError::NotAValue("+".to_owned()))
        );
    }

    #[test]
    fn evaluation_reads_a_real_memory() {
        struct Real(Memory);

        impl Inspect for Real {
            fn register(&self, _: RegisterName) -> u32 {
                0x10
            }

            fn read_byte(&self, address: Address) -> Result<u8, MemoryError> {
                self.0.read_byte(address)
            }
        }

        let mut memory = Memory::new();
        memory.write(0x10, 4, 0xAABB_CCDD).unwrap();
        assert_eq!(evaluate("*$esp", &Real(memory)), Ok(0xDD));
    }

    fn arithmetic() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            (0u32..1000).prop_map(|n| n.to_string()),
            (0u32..0x1000).prop_map(|n| format!("0x{:x}", n)),
        ];
        leaf.prop_recursive(3, 8, 2, |inner| {
            prop_oneof![
                (
                    inner.clone(),
                    prop::sample::select(vec!["+", "-", "*", "/", "==", "!=", "&&", "||"]),
                    inner.clone()
                )
                    .prop_map(|(lhs, op, rhs)| format!("{} {} {}", lhs, op, rhs)),
                inner.clone().prop_map(|e| format!("({})", e)),
                inner.prop_map(|e| format!("-{}", e)),
            ]
        })
    }

    proptest! {
        #[test]
        fn parentheses_do_not_change_the_value(expression in arithmetic()) {
            let state = FakeState::default();
            let wrapped = format!("({})", expression);
            prop_assume!(lexer::tokenize(&wrapped).is_ok());
            match evaluate(&expression, &state) {
                Ok(value) => {
                    prop_assert_eq!(evaluate(&wrapped, &state), Ok(value));
                }
                Err(_) => {
                    prop_assert!(evaluate(&wrapped, &state).is_err());
                }
            }
        }
    }
}
