//! Operand expression evaluator.
//!
//! EDASM's operator set is not the C/Unix one: `!` is XOR, `^` is AND,
//! `|` is OR. Precedence is `*` `/` over `+` `-` over the bitwise
//! operators, with parentheses overriding. Unary `-`, `+`, `<` (low
//! byte) and `>` (high byte) bind to the start of a term.

use super::symbol_table::{SymbolFlags, SymbolTable};

/// Result of a successful evaluation. Relocation attributes OR-combine
/// across every operand in the expression; byte extraction clears them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExprResult {
    pub value: u16,
    pub is_relative: bool,
    pub is_external: bool,
    pub is_forward_ref: bool,
    /// Symbols referenced by the expression, in lookup order.
    pub refs: Vec<String>,
}

pub struct ExpressionEvaluator<'a> {
    symbols: &'a SymbolTable,
}

struct Parser<'a, 'b> {
    chars: Vec<char>,
    pos: usize,
    pass: u8,
    symbols: &'a SymbolTable,
    refs: &'b mut Vec<String>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self { symbols }
    }

    /// Evaluate `expr` for the given pass (1 or 2). In pass 1 an
    /// unresolved symbol yields value 0 with `is_forward_ref` set; in
    /// pass 2 it is an error.
    pub fn evaluate(&self, expr: &str, pass: u8) -> Result<ExprResult, String> {
        let mut trimmed = expr.trim();
        // A leading `#` is the immediate-mode marker, not part of the
        // expression proper.
        if let Some(rest) = trimmed.strip_prefix('#') {
            trimmed = rest.trim_start();
        }
        if trimmed.is_empty() {
            return Err("Empty expression".to_string());
        }

        let mut refs = Vec::new();
        let mut parser = Parser {
            chars: trimmed.chars().collect(),
            pos: 0,
            pass,
            symbols: self.symbols,
            refs: &mut refs,
        };
        let mut result = parser.parse_expr()?;
        parser.skip_space();
        if parser.pos < parser.chars.len() {
            return Err(format!(
                "Unexpected character '{}' in expression",
                parser.chars[parser.pos]
            ));
        }
        result.refs = refs;
        Ok(result)
    }
}

/// Partial result while parsing: value plus relocation attributes.
#[derive(Clone, Copy, Default)]
struct Term {
    value: u16,
    relative: bool,
    external: bool,
    forward: bool,
}

impl Term {
    fn combine(self, other: Term, value: u16) -> Term {
        Term {
            value,
            relative: self.relative || other.relative,
            external: self.external || other.external,
            forward: self.forward || other.forward,
        }
    }
}

impl Parser<'_, '_> {
    fn skip_space(&mut self) {
        while self.pos < self.chars.len()
            && (self.chars[self.pos] == ' ' || self.chars[self.pos] == '\t')
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_space();
        self.chars.get(self.pos).copied()
    }

    // bitwise := additive (('!' | '^' | '|') additive)*
    fn parse_expr(&mut self) -> Result<ExprResult, String> {
        let term = self.parse_bitwise()?;
        Ok(ExprResult {
            value: term.value,
            is_relative: term.relative,
            is_external: term.external,
            is_forward_ref: term.forward,
            refs: Vec::new(),
        })
    }

    fn parse_bitwise(&mut self) -> Result<Term, String> {
        let mut lhs = self.parse_additive()?;
        while let Some(op) = self.peek() {
            if op != '!' && op != '^' && op != '|' {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_additive()?;
            let value = match op {
                '!' => lhs.value ^ rhs.value,
                '^' => lhs.value & rhs.value,
                _ => lhs.value | rhs.value,
            };
            lhs = lhs.combine(rhs, value);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Term, String> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(op) = self.peek() {
            if op != '+' && op != '-' {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            let value = match op {
                '+' => lhs.value.wrapping_add(rhs.value),
                _ => lhs.value.wrapping_sub(rhs.value),
            };
            lhs = lhs.combine(rhs, value);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Term, String> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.peek() {
            if op != '*' && op != '/' {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_unary()?;
            let value = match op {
                '*' => lhs.value.wrapping_mul(rhs.value),
                // Division by zero yields zero.
                _ => {
                    if rhs.value == 0 {
                        0
                    } else {
                        lhs.value / rhs.value
                    }
                }
            };
            lhs = lhs.combine(rhs, value);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Term, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                let mut t = self.parse_unary()?;
                t.value = t.value.wrapping_neg();
                Ok(t)
            }
            Some('+') => {
                self.pos += 1;
                self.parse_unary()
            }
            Some('<') => {
                self.pos += 1;
                let mut t = self.parse_unary()?;
                t.value &= 0x00FF;
                // Byte extraction strips relocation attributes.
                t.relative = false;
                t.external = false;
                Ok(t)
            }
            Some('>') => {
                self.pos += 1;
                let mut t = self.parse_unary()?;
                t.value >>= 8;
                t.relative = false;
                t.external = false;
                Ok(t)
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Term, String> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Err("Unexpected end of expression".to_string()),
        };

        match c {
            '(' => {
                self.pos += 1;
                let inner = self.parse_bitwise()?;
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("Missing ')'".to_string()),
                }
            }
            '$' => {
                self.pos += 1;
                self.parse_radix(16, |c| c.is_ascii_hexdigit(), "hex")
            }
            '%' => {
                self.pos += 1;
                self.parse_radix(2, |c| c == '0' || c == '1', "binary")
            }
            '\'' => {
                self.pos += 1;
                let ch = self
                    .chars
                    .get(self.pos)
                    .copied()
                    .ok_or_else(|| "Unterminated character literal".to_string())?;
                self.pos += 1;
                if self.chars.get(self.pos) == Some(&'\'') {
                    self.pos += 1;
                }
                Ok(Term {
                    value: ch as u16 & 0x00FF,
                    ..Default::default()
                })
            }
            c if c.is_ascii_digit() => self.parse_radix(10, |c| c.is_ascii_digit(), "decimal"),
            c if c.is_ascii_alphabetic() || c == '_' || c == '@' => self.parse_symbol(),
            c => Err(format!("Invalid character '{c}' in expression")),
        }
    }

    fn parse_radix(
        &mut self,
        radix: u32,
        valid: fn(char) -> bool,
        kind: &str,
    ) -> Result<Term, String> {
        let start = self.pos;
        while self.pos < self.chars.len() && valid(self.chars[self.pos]) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(format!("Invalid {kind} literal"));
        }
        let mut value: u16 = 0;
        for &c in &self.chars[start..self.pos] {
            let digit = c.to_digit(radix).unwrap_or(0) as u16;
            value = value.wrapping_mul(radix as u16).wrapping_add(digit);
        }
        Ok(Term {
            value,
            ..Default::default()
        })
    }

    fn parse_symbol(&mut self) -> Result<Term, String> {
        let start = self.pos;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '@') {
                break;
            }
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.refs.push(name.clone());

        match self.symbols.lookup(&name) {
            Some(sym) => Ok(Term {
                value: sym.value,
                relative: sym.flags.contains(SymbolFlags::RELATIVE),
                external: sym.flags.contains(SymbolFlags::EXTERNAL),
                forward: false,
            }),
            None if self.pass == 1 => Ok(Term {
                value: 0,
                forward: true,
                ..Default::default()
            }),
            None => Err(format!("Undefined symbol: {name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, pass: u8) -> Result<ExprResult, String> {
        let symbols = SymbolTable::new();
        ExpressionEvaluator::new(&symbols).evaluate(expr, pass)
    }

    fn eval_with(symbols: &SymbolTable, expr: &str, pass: u8) -> ExprResult {
        ExpressionEvaluator::new(symbols).evaluate(expr, pass).unwrap()
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("$FF", 2).unwrap().value, 0xFF);
        assert_eq!(eval("$1000", 2).unwrap().value, 0x1000);
        assert_eq!(eval("%1010", 2).unwrap().value, 10);
        assert_eq!(eval("123", 2).unwrap().value, 123);
        assert_eq!(eval("'A'", 2).unwrap().value, 0x41);
    }

    #[test]
    fn test_immediate_marker_skipped() {
        assert_eq!(eval("#$42", 2).unwrap().value, 0x42);
    }

    #[test]
    fn test_precedence() {
        // * binds tighter than +
        assert_eq!(eval("2+3*4", 2).unwrap().value, 14);
        // + binds tighter than bitwise OR
        assert_eq!(eval("1|2+4", 2).unwrap().value, 1 | 6);
        // parentheses override
        assert_eq!(eval("(2+3)*4", 2).unwrap().value, 20);
    }

    #[test]
    fn test_edasm_bitwise_operators() {
        assert_eq!(eval("$FF!$0F", 2).unwrap().value, 0xF0); // XOR
        assert_eq!(eval("$FF^$0F", 2).unwrap().value, 0x0F); // AND
        assert_eq!(eval("$F0|$0F", 2).unwrap().value, 0xFF); // OR
    }

    #[test]
    fn test_unary() {
        assert_eq!(eval("-1", 2).unwrap().value, 0xFFFF);
        assert_eq!(eval("<$1234", 2).unwrap().value, 0x34);
        assert_eq!(eval(">$1234", 2).unwrap().value, 0x12);
    }

    #[test]
    fn test_divide_by_zero_is_zero() {
        assert_eq!(eval("10/0", 2).unwrap().value, 0);
    }

    #[test]
    fn test_forward_ref_pass1_vs_pass2() {
        let r = eval("LATER", 1).unwrap();
        assert_eq!(r.value, 0);
        assert!(r.is_forward_ref);

        let e = eval("LATER", 2).unwrap_err();
        assert!(e.contains("Undefined symbol: LATER"));
    }

    #[test]
    fn test_flag_propagation() {
        let mut symbols = SymbolTable::new();
        symbols
            .define("REL", 0x1000, SymbolFlags::RELATIVE, 1)
            .unwrap();
        symbols
            .define("EXT", 0, SymbolFlags::EXTERNAL | SymbolFlags::UNDEFINED, 2)
            .unwrap();

        let r = eval_with(&symbols, "REL+2", 2);
        assert_eq!(r.value, 0x1002);
        assert!(r.is_relative);
        assert!(!r.is_external);

        let r = eval_with(&symbols, "EXT", 2);
        assert!(r.is_external);

        // Byte extraction clears relocation attributes.
        let r = eval_with(&symbols, "<REL", 2);
        assert_eq!(r.value, 0x00);
        assert!(!r.is_relative);

        let r = eval_with(&symbols, ">REL+1", 2);
        assert!(!r.is_relative);
    }

    #[test]
    fn test_refs_collected() {
        let mut symbols = SymbolTable::new();
        symbols.define("A", 1, SymbolFlags::empty(), 1).unwrap();
        symbols.define("B", 2, SymbolFlags::empty(), 2).unwrap();
        let r = eval_with(&symbols, "A+B*2", 2);
        assert_eq!(r.refs, ["A", "B"]);
        assert_eq!(r.value, 5);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_eq!(eval("$FFFF+2", 2).unwrap().value, 1);
        assert_eq!(eval("0-1", 2).unwrap().value, 0xFFFF);
    }

    #[test]
    fn test_errors() {
        assert!(eval("", 2).is_err());
        assert!(eval("(1+2", 2).is_err());
        assert!(eval("$", 2).is_err());
        assert!(eval("1+?", 2).is_err());
    }
}
