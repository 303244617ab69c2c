//! Mixed-base expression evaluator.
//!
//! Expressions combine register names, debugger variables, integer
//! literals in a configurable default base, quoted character constants,
//! and grouped subexpressions, under two operator-precedence tables: the
//! default table, and the DEC-style table selected by angle-bracket
//! grouping (where the bitwise operators collapse to one level and `,,`
//! packs two 18-bit halves).
//!
//! Evaluation runs a value stack against an operator stack; a new binary
//! operator whose precedence does not exceed the stack top forces the
//! top to evaluate first. Unary prefixes collect on their own explicit
//! stack and apply innermost-first when the value arrives.

use once_cell::sync::Lazy;
use regex::Regex;
use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum EvalError {
    #[snafu(display("unknown symbol \"{}\"", name))]
    UnknownSymbol { name: String },

    #[snafu(display("bad literal \"{}\" for base {}", text, base))]
    BadLiteral { text: String, base: u32 },

    #[snafu(display("character constant \"{}\" too long", text))]
    LiteralTooLong { text: String },

    #[snafu(display("unbalanced grouping"))]
    Unbalanced,

    #[snafu(display("operator \"{}\" is missing an operand", op))]
    MissingOperand { op: String },

    #[snafu(display("\"{}\" is not an operator here", op))]
    BadOperator { op: String },

    #[snafu(display("division by zero"))]
    DivideByZero,

    #[snafu(display("empty expression"))]
    Empty,
}

/// Where register and variable values come from during evaluation.
pub trait Symbols {
    fn lookup(&self, name: &str) -> Option<u64>;
}

impl Symbols for std::collections::HashMap<String, u64> {
    fn lookup(&self, name: &str) -> Option<u64> {
        self.get(name).or_else(|| self.get(&name.to_uppercase())).copied()
    }
}

/// Grouping delimiters. Angle brackets flip the evaluator into the
/// DEC-style precedence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStyle {
    Brace,
    Bracket,
    Angle,
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
    /// Leading-zero count within the configured word width.
    Lzc,
}

static OP_RE: Lazy<Regex> = Lazy::new(|| {
    // Longest alternatives first, or the two-character forms fall apart.
    Regex::new(r"\^_|\^!|\^-|\^[BbOoDdLl]|\|\||&&|!=|==|>=|<=|>>|<<|,,|[-+*/%&|<>{}!~^_]")
        .expect("operator pattern")
});

static BSHIFT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)[Bb]([0-9]+)").expect("shift-suffix pattern"));

pub struct Evaluator<'a> {
    pub default_base: u32,
    pub default_bits: u32,
    pub group: GroupStyle,
    symbols: &'a dyn Symbols,
}

impl<'a> Evaluator<'a> {
    pub fn new(symbols: &'a dyn Symbols) -> Self {
        Self {
            default_base: 16,
            default_bits: 32,
            group: GroupStyle::Brace,
            symbols,
        }
    }

    pub fn with_base(mut self, base: u32) -> Self {
        self.default_base = base;
        self
    }

    pub fn with_bits(mut self, bits: u32) -> Self {
        self.default_bits = bits;
        self
    }

    pub fn with_group(mut self, group: GroupStyle) -> Self {
        self.group = group;
        self
    }

    /// Evaluates `text` to an unsigned value truncated to `default_bits`.
    pub fn parse(&self, text: &str) -> Result<u64, EvalError> {
        let dec = self.group == GroupStyle::Angle;
        let text = self.preprocess(text)?;

        let mut vals: Vec<u64> = Vec::new();
        let mut ops: Vec<String> = Vec::new();
        let mut unary: Vec<UnaryOp> = Vec::new();
        let mut pending_base: Option<u32> = None;
        let mut expect_value = true;

        let mut last = 0;
        let mut tokens: Vec<(bool, &str)> = Vec::new(); // (is_op, text)
        for m in OP_RE.find_iter(&text) {
            let before = text[last..m.start()].trim();
            if !before.is_empty() {
                tokens.push((false, before));
            }
            tokens.push((true, m.as_str()));
            last = m.end();
        }
        let tail = text[last..].trim();
        if !tail.is_empty() {
            tokens.push((false, tail));
        }

        for (is_op, tok) in tokens {
            if !is_op {
                let base = pending_base.take().unwrap_or(self.default_base);
                let mut value = self.value_of(tok, base)?;
                while let Some(op) = unary.pop() {
                    value = self.apply_unary(op, value);
                }
                vals.push(value);
                expect_value = false;
                continue;
            }

            if expect_value {
                // Prefix position: unary operators, base overrides, and
                // opening groups are legal; anything else lacks an
                // operand.
                match tok.to_ascii_uppercase().as_str() {
                    "-" | "^-" => unary.push(UnaryOp::Neg),
                    "~" => unary.push(UnaryOp::Not),
                    "^L" => unary.push(UnaryOp::Lzc),
                    "^B" => pending_base = Some(2),
                    "^O" => pending_base = Some(8),
                    "^D" => pending_base = Some(10),
                    "{" => ops.push("{".to_string()),
                    _ => {
                        return Err(EvalError::MissingOperand { op: tok.into() });
                    }
                }
                continue;
            }

            if tok == "}" {
                loop {
                    match ops.pop() {
                        Some(op) if op == "{" => break,
                        Some(op) => apply_stacked(&mut vals, &op, dec)?,
                        None => return Err(EvalError::Unbalanced),
                    }
                }
                // A closed group behaves as a value.
                continue;
            }

            let prec = precedence(tok, dec).ok_or_else(|| EvalError::BadOperator {
                op: tok.to_string(),
            })?;
            while let Some(top) = ops.last() {
                if top == "{" {
                    break;
                }
                match precedence(top, dec) {
                    Some(p) if p >= prec => {
                        let op = ops.pop().unwrap();
                        apply_stacked(&mut vals, &op, dec)?;
                    }
                    _ => break,
                }
            }
            ops.push(tok.to_string());
            expect_value = true;
        }

        if expect_value && (!vals.is_empty() || !ops.is_empty()) {
            return Err(EvalError::MissingOperand { op: "<end>".into() });
        }
        while let Some(op) = ops.pop() {
            if op == "{" {
                return Err(EvalError::Unbalanced);
            }
            apply_stacked(&mut vals, &op, dec)?;
        }

        match vals.pop() {
            Some(v) if vals.is_empty() => Ok(self.finish(v)),
            Some(_) => Err(EvalError::BadOperator { op: "<value>".into() }),
            None => Err(EvalError::Empty),
        }
    }

    /// Rewrites character constants and alternate grouping characters
    /// into the canonical token alphabet.
    fn preprocess(&self, text: &str) -> Result<String, EvalError> {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\'' | '"' => {
                    let mut lit = String::new();
                    loop {
                        match chars.next() {
                            Some(c) if c == ch => break,
                            Some(c) => lit.push(c),
                            None => return Err(EvalError::Unbalanced),
                        }
                    }
                    let packed = pack_chars(&lit, ch == '\'')?;
                    out.push_str(&format!("^D{}", packed));
                }
                '[' | ']' if self.group == GroupStyle::Bracket => {
                    out.push(if ch == '[' { '{' } else { '}' });
                }
                '<' | '>' if self.group == GroupStyle::Angle => {
                    out.push(if ch == '<' { '{' } else { '}' });
                }
                _ => out.push(ch),
            }
        }

        // `nBs` shift-suffix notation: both halves are decimal and the
        // suffix becomes an explicit shift. Only sensible outside base 16
        // (where "5B3" is already a number).
        if self.default_base != 16 {
            out = BSHIFT_RE.replace_all(&out, "^D$1^_^D$2").into_owned();
        }
        Ok(out)
    }

    fn value_of(&self, tok: &str, base: u32) -> Result<u64, EvalError> {
        if let Some(v) = self.symbols.lookup(tok) {
            return Ok(v);
        }

        let (text, base) = if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
            (hex, 16)
        } else if let Some(dec) = tok.strip_suffix('.') {
            (dec, 10)
        } else {
            (tok, base)
        };

        u64::from_str_radix(text, base).map_err(|_| {
            if text.chars().next().map_or(false, |c| c.is_ascii_digit()) {
                EvalError::BadLiteral {
                    text: tok.to_string(),
                    base,
                }
            } else {
                EvalError::UnknownSymbol {
                    name: tok.to_string(),
                }
            }
        })
    }

    fn apply_unary(&self, op: UnaryOp, value: u64) -> u64 {
        match op {
            UnaryOp::Neg => value.wrapping_neg(),
            UnaryOp::Not => !value,
            UnaryOp::Lzc => {
                let used = 64 - value.leading_zeros();
                self.default_bits.saturating_sub(used) as u64
            }
        }
    }

    fn finish(&self, value: u64) -> u64 {
        let truncated = truncate(value, self.default_bits, true);
        if truncated != value {
            log::warn!(
                "expression value {:#x} does not fit in {} bits",
                value,
                self.default_bits
            );
        }
        truncated
    }
}

/// Truncates to `bits`, unsigned (modulo) or signed (sign-extended into
/// the full word).
pub fn truncate(value: u64, bits: u32, unsigned: bool) -> u64 {
    if bits >= 64 {
        return value;
    }
    let mask = (1u64 << bits) - 1;
    let v = value & mask;
    if unsigned {
        v
    } else {
        let sign = 1u64 << (bits - 1);
        if v & sign != 0 {
            v | !mask
        } else {
            v
        }
    }
}

fn apply_stacked(vals: &mut Vec<u64>, op: &str, dec: bool) -> Result<(), EvalError> {
    let r = vals.pop().ok_or(EvalError::MissingOperand { op: op.into() })?;
    let l = vals.pop().ok_or(EvalError::MissingOperand { op: op.into() })?;
    vals.push(apply_binary(op, l, r, dec)?);
    Ok(())
}

fn apply_binary(op: &str, l: u64, r: u64, _dec: bool) -> Result<u64, EvalError> {
    Ok(match op {
        "||" => (l != 0 || r != 0) as u64,
        "&&" => (l != 0 && r != 0) as u64,
        "|" | "!" => l | r,
        "^!" => l ^ r,
        "&" => l & r,
        "==" => (l == r) as u64,
        "!=" => (l != r) as u64,
        "<" => (l < r) as u64,
        "<=" => (l <= r) as u64,
        ">" => (l > r) as u64,
        ">=" => (l >= r) as u64,
        "<<" => shl(l, r as i64),
        ">>" => shl(l, -(r as i64)),
        "+" => l.wrapping_add(r),
        "-" => l.wrapping_sub(r),
        "*" => l.wrapping_mul(r),
        "/" => l.checked_div(r).ok_or(EvalError::DivideByZero)?,
        "%" => l.checked_rem(r).ok_or(EvalError::DivideByZero)?,
        // MACRO-10 style shift: positive counts go left, negative right.
        "_" | "^_" => shl(l, r as i64),
        // Halfword combine: two 18-bit halves packed into one word.
        ",," => ((l & 0o777777) << 18) | (r & 0o777777),
        _ => return Err(EvalError::BadOperator { op: op.into() }),
    })
}

fn shl(value: u64, count: i64) -> u64 {
    if count >= 64 || count <= -64 {
        0
    } else if count >= 0 {
        value << count
    } else {
        value >> -count
    }
}

fn precedence(op: &str, dec: bool) -> Option<u32> {
    Some(match op {
        ",," if dec => 1,
        "||" => 5,
        "&&" => 6,
        "|" | "!" => {
            if dec {
                15
            } else {
                7
            }
        }
        "^!" => {
            if dec {
                15
            } else {
                8
            }
        }
        "&" => {
            if dec {
                15
            } else {
                9
            }
        }
        "==" | "!=" => 10,
        "<" | "<=" | ">" | ">=" => 11,
        "<<" | ">>" => 12,
        "+" | "-" => 13,
        "*" | "/" | "%" => 14,
        "_" | "^_" => 19,
        _ => return None,
    })
}

/// Packs a character constant: 7-bit ASCII (up to five characters) or
/// DEC sixbit (up to six, folded to the 0x20..0x5F range).
fn pack_chars(text: &str, seven_bit: bool) -> Result<u64, EvalError> {
    let max = if seven_bit { 5 } else { 6 };
    if text.chars().count() > max {
        return Err(EvalError::LiteralTooLong { text: text.into() });
    }
    let mut v = 0u64;
    for ch in text.chars() {
        if seven_bit {
            v = v << 7 | (ch as u64 & 0x7F);
        } else {
            let folded = ch.to_ascii_uppercase() as u64;
            v = v << 6 | (folded.wrapping_sub(0x20) & 0x3F);
        }
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn eval(text: &str) -> Result<u64, EvalError> {
        let symbols = HashMap::new();
        Evaluator::new(&symbols).parse(text)
    }

    #[test]
    fn groups_beat_precedence() {
        assert_eq!(eval("{3+4}*2"), Ok(14));
        assert_eq!(eval("3+4*2"), Ok(11));
    }

    #[test]
    fn hex_literals_and_masking() {
        assert_eq!(eval("0xff & 0xf0"), Ok(0xF0));
        assert_eq!(eval("ff & f0"), Ok(0xF0));
    }

    #[test]
    fn decimal_suffix() {
        assert_eq!(eval("10."), Ok(10));
        assert_eq!(eval("10"), Ok(0x10));
    }

    #[test]
    fn base_override_prefixes() {
        assert_eq!(eval("^D10"), Ok(10));
        assert_eq!(eval("^O17"), Ok(0o17));
        assert_eq!(eval("^B101"), Ok(5));
    }

    #[test]
    fn unary_stack_applies_innermost_first() {
        assert_eq!(eval("-1"), Ok(0xFFFF_FFFF));
        assert_eq!(eval("~0"), Ok(0xFFFF_FFFF));
        assert_eq!(eval("-~0"), Ok(1));
    }

    #[test]
    fn leading_zero_count_uses_the_word_width() {
        let symbols = HashMap::new();
        let eval = Evaluator::new(&symbols).with_bits(16);
        assert_eq!(eval.parse("^L1"), Ok(15));
        assert_eq!(eval.parse("^L0"), Ok(16));
        assert_eq!(eval.parse("^L8000"), Ok(0));
    }

    #[test]
    fn registers_resolve_through_symbols() {
        let mut symbols = HashMap::new();
        symbols.insert("AX".to_string(), 0x1234u64);
        let eval = Evaluator::new(&symbols);
        assert_eq!(eval.parse("ax+1"), Ok(0x1235));
        assert_eq!(
            eval.parse("zz"),
            Err(EvalError::UnknownSymbol { name: "zz".into() })
        );
    }

    #[test]
    fn dec_mode_angle_groups_and_halfword_packing() {
        let symbols = HashMap::new();
        let eval = Evaluator::new(&symbols)
            .with_base(8)
            .with_bits(36)
            .with_group(GroupStyle::Angle);
        assert_eq!(eval.parse("<1+2>*3"), Ok(9));
        assert_eq!(eval.parse("1,,2"), Ok((1 << 18) | 2));
        // Shift-suffix notation rewrites to an explicit left shift.
        assert_eq!(eval.parse("2B3"), Ok(16));
    }

    #[test]
    fn character_constants_pack() {
        assert_eq!(eval("'A'"), Ok(0x41));
        assert_eq!(eval("'AB'"), Ok((0x41 << 7) | 0x42));
        assert_eq!(eval("\"A\""), Ok(0x21));
        assert!(matches!(
            eval("'TOOBIG'"),
            Err(EvalError::LiteralTooLong { .. })
        ));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("{2>1} && {1==1}"), Ok(1));
        assert_eq!(eval("2<1 || 0"), Ok(0));
        assert_eq!(eval("1 << 4"), Ok(16));
        assert_eq!(eval("100 >> 8"), Ok(1));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval("5/0"), Err(EvalError::DivideByZero));
        assert_eq!(eval("5%0"), Err(EvalError::DivideByZero));
    }

    #[test]
    fn truncation_semantics() {
        assert_eq!(truncate(0x1_2345, 16, true), 0x2345);
        assert_eq!(truncate(0xFFFF, 16, false), u64::MAX);
        assert_eq!(truncate(0x7FFF, 16, false), 0x7FFF);
        assert_eq!(truncate(u64::MAX, 64, true), u64::MAX);
    }
}
