use std::fmt;

use thiserror::Error;

/// Longest text a single token may carry.
pub const MAX_TOKEN_LENGTH: usize = 31;
/// Longest token sequence a single expression may produce.
pub const MAX_TOKENS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Decimal,
    Hex,
    Register,
    Plus,
    Minus,
    Star,
    Slash,
    Not,
    LeftParen,
    RightParen,
    And,
    Or,
    Equal,
    NotEqual,
    /// Prefix `-`, only ever produced by [`disambiguate`].
    Negate,
    /// Prefix `*`, only ever produced by [`disambiguate`].
    Deref,
}

impl TokenKind {
    pub fn is_literal(self) -> bool {
        matches!(self, TokenKind::Decimal | TokenKind::Hex)
    }

    /// Whether a token of this kind can close an operand, making a following `-` or `*` binary.
    fn ends_operand(self) -> bool {
        matches!(
            self,
            TokenKind::Decimal | TokenKind::Hex | TokenKind::Register | TokenKind::RightParen
        )
    }

    pub fn symbol(self) -> &'static str {
        use TokenKind::*;

        match self {
            Decimal => "decimal literal",
            Hex => "hex literal",
            Register => "register",
            Plus => "+",
            Minus | Negate => "-",
            Star | Deref => "*",
            Slash => "/",
            Not => "!",
            LeftParen => "(",
            RightParen => ")",
            And => "&&",
            Or => "||",
            Equal => "==",
            NotEqual => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Matched text; register names are stored without their `$`.
    pub text: String,
}

impl Token {
    fn new(kind: TokenKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_owned(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Decimal | TokenKind::Hex => f.write_str(&self.text),
            TokenKind::Register => write!(f, "${}", self.text),
            kind => f.write_str(kind.symbol()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("no match at position {position}")]
    NoMatch { position: usize },
    #[error("token at position {position} is {length} characters long (limit {})", MAX_TOKEN_LENGTH)]
    TokenTooLong { position: usize, length: usize },
    #[error("expression has more than {} tokens", MAX_TOKENS)]
    TooManyTokens,
}

impl LexError {
    pub fn position(&self) -> Option<usize> {
        match *self {
            LexError::NoMatch { position } | LexError::TokenTooLong { position, .. } => {
                Some(position)
            }
            LexError::TooManyTokens => None,
        }
    }
}

/// Register names after `$`, longest first so `$eax` never matches as `$ax`.
const REGISTER_NAMES: [&str; 25] = [
    "eax", "ebx", "ecx", "edx", "esp", "ebp", "esi", "edi", "eip", "ax", "bx", "cx", "dx", "sp",
    "bp", "si", "di", "al", "bl", "cl", "dl", "ah", "bh", "ch", "dh",
];

enum Lexeme {
    Skip,
    Token(TokenKind),
}

/// One lexical rule: returns the byte length it matches at the start of `input`.
type Rule = fn(&str) -> Option<(usize, Lexeme)>;

fn spaces(input: &str) -> Option<(usize, Lexeme)> {
    let length = input.len() - input.trim_start_matches(' ').len();
    (length > 0).then(|| (length, Lexeme::Skip))
}

fn fixed(input: &str, table: &[(&str, TokenKind)]) -> Option<(usize, Lexeme)> {
    table
        .iter()
        .find(|(symbol, _)| input.starts_with(symbol))
        .map(|&(symbol, kind)| (symbol.len(), Lexeme::Token(kind)))
}

fn two_character_operators(input: &str) -> Option<(usize, Lexeme)> {
    fixed(
        input,
        &[
            ("==", TokenKind::Equal),
            ("!=", TokenKind::NotEqual),
            ("&&", TokenKind::And),
            ("||", TokenKind::Or),
        ],
    )
}

fn hex_literal(input: &str) -> Option<(usize, Lexeme)> {
    let digits = input.strip_prefix("0x")?;
    let length = digits
        .bytes()
        .take_while(|byte| byte.is_ascii_hexdigit())
        .count();
    Some((2 + length, Lexeme::Token(TokenKind::Hex)))
}

fn decimal_literal(input: &str) -> Option<(usize, Lexeme)> {
    let token = |length| Some((length, Lexeme::Token(TokenKind::Decimal)));
    match input.bytes().next()? {
        b'0' => token(1),
        b'1'..=b'9' => token(input.bytes().take_while(u8::is_ascii_digit).count()),
        _ => None,
    }
}

fn single_character_operators(input: &str) -> Option<(usize, Lexeme)> {
    fixed(
        input,
        &[
            ("+", TokenKind::Plus),
            ("-", TokenKind::Minus),
            ("*", TokenKind::Star),
            ("/", TokenKind::Slash),
            ("(", TokenKind::LeftParen),
            (")", TokenKind::RightParen),
            ("!", TokenKind::Not),
        ],
    )
}

fn register(input: &str) -> Option<(usize, Lexeme)> {
    let name = input.strip_prefix('$')?;
    REGISTER_NAMES
        .iter()
        .find(|candidate| name.starts_with(*candidate))
        .map(|candidate| (1 + candidate.len(), Lexeme::Token(TokenKind::Register)))
}

/// Tried in order; the first rule that matches wins. Two-character operators come before
/// `!`, and hex literals before decimal ones so `0x1` is not read as `0`.
const RULES: [Rule; 6] = [
    spaces,
    two_character_operators,
    hex_literal,
    decimal_literal,
    single_character_operators,
    register,
];

pub fn tokenize(text: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut position = 0;

    while position < text.len() {
        let rest = &text[position..];
        let (length, lexeme) = RULES
            .iter()
            .find_map(|rule| rule(rest))
            .ok_or(LexError::NoMatch { position })?;

        if let Lexeme::Token(kind) = lexeme {
            let matched = &rest[..length];
            let text = match kind {
                TokenKind::Register => &matched[1..],
                _ => matched,
            };
            if text.len() > MAX_TOKEN_LENGTH {
                return Err(LexError::TokenTooLong {
                    position,
                    length: text.len(),
                });
            }
            if tokens.len() == MAX_TOKENS {
                return Err(LexError::TooManyTokens);
            }
            tokens.push(Token::new(kind, text));
        }
        position += length;
    }

    Ok(tokens)
}

/// Reclassifies `-` and `*` that do not follow an operand as negation and dereference.
pub fn disambiguate(tokens: &mut [Token]) {
    let mut previous: Option<TokenKind> = None;
    for token in tokens.iter_mut() {
        let follows_operand = previous.map_or(false, TokenKind::ends_operand);
        match token.kind {
            TokenKind::Minus if !follows_operand => token.kind = TokenKind::Negate,
            TokenKind::Star if !follows_operand => token.kind = TokenKind::Deref,
            _ => {}
        }
        previous = Some(token.kind);
    }
}
