//! Instruction encoding tables: (mnemonic, addressing mode) → opcode
//! byte and length, plus the syntactic addressing-mode detector.

use std::collections::HashMap;

/// The thirteen addressing modes the assembler can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndexedIndirect,
    IndirectIndexed,
    Relative,
}

impl AddressingMode {
    /// Encoded instruction length including the opcode byte.
    pub fn length(self) -> u16 {
        use AddressingMode::*;
        match self {
            Implied | Accumulator => 1,
            Immediate | ZeroPage | ZeroPageX | ZeroPageY | IndexedIndirect | IndirectIndexed
            | Relative => 2,
            Absolute | AbsoluteX | AbsoluteY | Indirect => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub mnemonic: &'static str,
    pub mode: AddressingMode,
    pub code: u8,
    pub length: u16,
}

/// Immutable (mnemonic, mode) index over the legal 6502 instruction
/// set, built once at startup.
pub struct OpcodeTable {
    table: HashMap<&'static str, Vec<Opcode>>,
}

use AddressingMode::*;

/// The legal NMOS 6502 opcode matrix.
#[rustfmt::skip]
const OPCODES: &[(&str, AddressingMode, u8)] = &[
    ("ADC", Immediate, 0x69), ("ADC", ZeroPage, 0x65), ("ADC", ZeroPageX, 0x75),
    ("ADC", Absolute, 0x6D), ("ADC", AbsoluteX, 0x7D), ("ADC", AbsoluteY, 0x79),
    ("ADC", IndexedIndirect, 0x61), ("ADC", IndirectIndexed, 0x71),

    ("AND", Immediate, 0x29), ("AND", ZeroPage, 0x25), ("AND", ZeroPageX, 0x35),
    ("AND", Absolute, 0x2D), ("AND", AbsoluteX, 0x3D), ("AND", AbsoluteY, 0x39),
    ("AND", IndexedIndirect, 0x21), ("AND", IndirectIndexed, 0x31),

    ("ASL", Accumulator, 0x0A), ("ASL", ZeroPage, 0x06), ("ASL", ZeroPageX, 0x16),
    ("ASL", Absolute, 0x0E), ("ASL", AbsoluteX, 0x1E),

    ("BCC", Relative, 0x90), ("BCS", Relative, 0xB0), ("BEQ", Relative, 0xF0),
    ("BMI", Relative, 0x30), ("BNE", Relative, 0xD0), ("BPL", Relative, 0x10),
    ("BVC", Relative, 0x50), ("BVS", Relative, 0x70),

    ("BIT", ZeroPage, 0x24), ("BIT", Absolute, 0x2C),

    ("BRK", Implied, 0x00),

    ("CLC", Implied, 0x18), ("CLD", Implied, 0xD8), ("CLI", Implied, 0x58),
    ("CLV", Implied, 0xB8),

    ("CMP", Immediate, 0xC9), ("CMP", ZeroPage, 0xC5), ("CMP", ZeroPageX, 0xD5),
    ("CMP", Absolute, 0xCD), ("CMP", AbsoluteX, 0xDD), ("CMP", AbsoluteY, 0xD9),
    ("CMP", IndexedIndirect, 0xC1), ("CMP", IndirectIndexed, 0xD1),

    ("CPX", Immediate, 0xE0), ("CPX", ZeroPage, 0xE4), ("CPX", Absolute, 0xEC),
    ("CPY", Immediate, 0xC0), ("CPY", ZeroPage, 0xC4), ("CPY", Absolute, 0xCC),

    ("DEC", ZeroPage, 0xC6), ("DEC", ZeroPageX, 0xD6), ("DEC", Absolute, 0xCE),
    ("DEC", AbsoluteX, 0xDE),
    ("DEX", Implied, 0xCA), ("DEY", Implied, 0x88),

    ("EOR", Immediate, 0x49), ("EOR", ZeroPage, 0x45), ("EOR", ZeroPageX, 0x55),
    ("EOR", Absolute, 0x4D), ("EOR", AbsoluteX, 0x5D), ("EOR", AbsoluteY, 0x59),
    ("EOR", IndexedIndirect, 0x41), ("EOR", IndirectIndexed, 0x51),

    ("INC", ZeroPage, 0xE6), ("INC", ZeroPageX, 0xF6), ("INC", Absolute, 0xEE),
    ("INC", AbsoluteX, 0xFE),
    ("INX", Implied, 0xE8), ("INY", Implied, 0xC8),

    ("JMP", Absolute, 0x4C), ("JMP", Indirect, 0x6C),
    ("JSR", Absolute, 0x20),

    ("LDA", Immediate, 0xA9), ("LDA", ZeroPage, 0xA5), ("LDA", ZeroPageX, 0xB5),
    ("LDA", Absolute, 0xAD), ("LDA", AbsoluteX, 0xBD), ("LDA", AbsoluteY, 0xB9),
    ("LDA", IndexedIndirect, 0xA1), ("LDA", IndirectIndexed, 0xB1),

    ("LDX", Immediate, 0xA2), ("LDX", ZeroPage, 0xA6), ("LDX", ZeroPageY, 0xB6),
    ("LDX", Absolute, 0xAE), ("LDX", AbsoluteY, 0xBE),

    ("LDY", Immediate, 0xA0), ("LDY", ZeroPage, 0xA4), ("LDY", ZeroPageX, 0xB4),
    ("LDY", Absolute, 0xAC), ("LDY", AbsoluteX, 0xBC),

    ("LSR", Accumulator, 0x4A), ("LSR", ZeroPage, 0x46), ("LSR", ZeroPageX, 0x56),
    ("LSR", Absolute, 0x4E), ("LSR", AbsoluteX, 0x5E),

    ("NOP", Implied, 0xEA),

    ("ORA", Immediate, 0x09), ("ORA", ZeroPage, 0x05), ("ORA", ZeroPageX, 0x15),
    ("ORA", Absolute, 0x0D), ("ORA", AbsoluteX, 0x1D), ("ORA", AbsoluteY, 0x19),
    ("ORA", IndexedIndirect, 0x01), ("ORA", IndirectIndexed, 0x11),

    ("PHA", Implied, 0x48), ("PHP", Implied, 0x08), ("PLA", Implied, 0x68),
    ("PLP", Implied, 0x28),

    ("ROL", Accumulator, 0x2A), ("ROL", ZeroPage, 0x26), ("ROL", ZeroPageX, 0x36),
    ("ROL", Absolute, 0x2E), ("ROL", AbsoluteX, 0x3E),

    ("ROR", Accumulator, 0x6A), ("ROR", ZeroPage, 0x66), ("ROR", ZeroPageX, 0x76),
    ("ROR", Absolute, 0x6E), ("ROR", AbsoluteX, 0x7E),

    ("RTI", Implied, 0x40), ("RTS", Implied, 0x60),

    ("SBC", Immediate, 0xE9), ("SBC", ZeroPage, 0xE5), ("SBC", ZeroPageX, 0xF5),
    ("SBC", Absolute, 0xED), ("SBC", AbsoluteX, 0xFD), ("SBC", AbsoluteY, 0xF9),
    ("SBC", IndexedIndirect, 0xE1), ("SBC", IndirectIndexed, 0xF1),

    ("SEC", Implied, 0x38), ("SED", Implied, 0xF8), ("SEI", Implied, 0x78),

    ("STA", ZeroPage, 0x85), ("STA", ZeroPageX, 0x95), ("STA", Absolute, 0x8D),
    ("STA", AbsoluteX, 0x9D), ("STA", AbsoluteY, 0x99),
    ("STA", IndexedIndirect, 0x81), ("STA", IndirectIndexed, 0x91),

    ("STX", ZeroPage, 0x86), ("STX", ZeroPageY, 0x96), ("STX", Absolute, 0x8E),
    ("STY", ZeroPage, 0x84), ("STY", ZeroPageX, 0x94), ("STY", Absolute, 0x8C),

    ("TAX", Implied, 0xAA), ("TAY", Implied, 0xA8), ("TSX", Implied, 0xBA),
    ("TXA", Implied, 0x8A), ("TXS", Implied, 0x9A), ("TYA", Implied, 0x98),
];

const BRANCHES: &[&str] = &["BCC", "BCS", "BEQ", "BMI", "BNE", "BPL", "BVC", "BVS"];

impl OpcodeTable {
    pub fn new() -> Self {
        let mut table: HashMap<&'static str, Vec<Opcode>> = HashMap::new();
        for &(mnem, mode, code) in OPCODES {
            table.entry(mnem).or_default().push(Opcode {
                mnemonic: mnem,
                mode,
                code,
                length: mode.length(),
            });
        }
        Self { table }
    }

    pub fn lookup(&self, mnemonic: &str, mode: AddressingMode) -> Option<&Opcode> {
        self.table
            .get(mnemonic)?
            .iter()
            .find(|op| op.mode == mode)
    }

    pub fn is_mnemonic(&self, mnemonic: &str) -> bool {
        self.table.contains_key(mnemonic)
    }

    pub fn is_branch(mnemonic: &str) -> bool {
        BRANCHES.contains(&mnemonic)
    }

    /// Every opcode in the table, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &Opcode> {
        self.table.values().flatten()
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Addressing-mode detection ─────────────────────────────────

/// Syntactic operand shape. `Direct*` shapes still need the evaluated
/// value to choose between zero-page and absolute encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    Implied,
    Accumulator,
    Immediate,
    IndexedIndirect,
    IndirectIndexed,
    Indirect,
    Direct,
    DirectX,
    DirectY,
    Relative,
}

/// Detected shape plus the bare expression text it wraps.
#[derive(Debug, Clone)]
pub struct DetectedOperand {
    pub shape: OperandShape,
    pub expr: String,
}

pub struct AddressingModeDetector;

impl AddressingModeDetector {
    /// Classify an operand string by syntax alone. Branch mnemonics
    /// turn a bare expression into `Relative`.
    pub fn detect(operand: &str, mnemonic: &str) -> DetectedOperand {
        let op = operand.trim();

        if op.is_empty() {
            return DetectedOperand {
                shape: OperandShape::Implied,
                expr: String::new(),
            };
        }
        if op == "A" {
            return DetectedOperand {
                shape: OperandShape::Accumulator,
                expr: String::new(),
            };
        }
        if let Some(rest) = op.strip_prefix('#') {
            return DetectedOperand {
                shape: OperandShape::Immediate,
                expr: rest.trim().to_string(),
            };
        }

        if op.starts_with('(') {
            let upper = op.to_ascii_uppercase();
            if upper.ends_with(",X)") {
                return DetectedOperand {
                    shape: OperandShape::IndexedIndirect,
                    expr: op[1..op.len() - 3].trim().to_string(),
                };
            }
            if upper.ends_with("),Y") {
                return DetectedOperand {
                    shape: OperandShape::IndirectIndexed,
                    expr: op[1..op.len() - 3].trim().to_string(),
                };
            }
            if op.ends_with(')') {
                return DetectedOperand {
                    shape: OperandShape::Indirect,
                    expr: op[1..op.len() - 1].trim().to_string(),
                };
            }
        }

        let upper = op.to_ascii_uppercase();
        if upper.ends_with(",X") {
            return DetectedOperand {
                shape: OperandShape::DirectX,
                expr: op[..op.len() - 2].trim().to_string(),
            };
        }
        if upper.ends_with(",Y") {
            return DetectedOperand {
                shape: OperandShape::DirectY,
                expr: op[..op.len() - 2].trim().to_string(),
            };
        }

        if OpcodeTable::is_branch(mnemonic) {
            return DetectedOperand {
                shape: OperandShape::Relative,
                expr: op.to_string(),
            };
        }

        DetectedOperand {
            shape: OperandShape::Direct,
            expr: op.to_string(),
        }
    }

    /// Resolve a shape to a concrete addressing mode. Zero-page is
    /// chosen when the value fits in a byte and the mnemonic has a
    /// zero-page form.
    pub fn resolve(
        shape: OperandShape,
        mnemonic: &str,
        value: u16,
        table: &OpcodeTable,
    ) -> AddressingMode {
        let pick = |zp: AddressingMode, abs: AddressingMode| {
            if value <= 0xFF && table.lookup(mnemonic, zp).is_some() {
                zp
            } else {
                abs
            }
        };
        match shape {
            OperandShape::Implied => AddressingMode::Implied,
            OperandShape::Accumulator => AddressingMode::Accumulator,
            OperandShape::Immediate => AddressingMode::Immediate,
            OperandShape::IndexedIndirect => AddressingMode::IndexedIndirect,
            OperandShape::IndirectIndexed => AddressingMode::IndirectIndexed,
            OperandShape::Indirect => AddressingMode::Indirect,
            OperandShape::Relative => AddressingMode::Relative,
            OperandShape::Direct => pick(AddressingMode::ZeroPage, AddressingMode::Absolute),
            OperandShape::DirectX => pick(AddressingMode::ZeroPageX, AddressingMode::AbsoluteX),
            OperandShape::DirectY => pick(AddressingMode::ZeroPageY, AddressingMode::AbsoluteY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let t = OpcodeTable::new();
        let op = t.lookup("LDA", AddressingMode::Immediate).unwrap();
        assert_eq!(op.code, 0xA9);
        assert_eq!(op.length, 2);

        let op = t.lookup("JMP", AddressingMode::Indirect).unwrap();
        assert_eq!(op.code, 0x6C);
        assert_eq!(op.length, 3);

        assert!(t.lookup("STA", AddressingMode::Immediate).is_none());
        assert!(t.lookup("XYZ", AddressingMode::Implied).is_none());
    }

    #[test]
    fn test_unique_opcode_bytes() {
        // Every (mnemonic, mode) pair must be unique.
        let mut seen = std::collections::HashSet::new();
        for &(mnem, mode, _) in OPCODES {
            assert!(seen.insert((mnem, mode)), "duplicate entry {mnem:?}");
        }
    }

    #[test]
    fn test_detect_shapes() {
        use OperandShape::*;
        let d = |op: &str, mn: &str| AddressingModeDetector::detect(op, mn);

        assert_eq!(d("", "RTS").shape, Implied);
        assert_eq!(d("A", "ASL").shape, Accumulator);
        assert_eq!(d("#$42", "LDA").shape, Immediate);
        assert_eq!(d("#$42", "LDA").expr, "$42");
        assert_eq!(d("($20,X)", "LDA").shape, IndexedIndirect);
        assert_eq!(d("($20,X)", "LDA").expr, "$20");
        assert_eq!(d("($20),Y", "LDA").shape, IndirectIndexed);
        assert_eq!(d("($1234)", "JMP").shape, Indirect);
        assert_eq!(d("$20,X", "LDA").shape, DirectX);
        assert_eq!(d("$20,Y", "LDX").shape, DirectY);
        assert_eq!(d("LOOP", "BNE").shape, Relative);
        assert_eq!(d("$1234", "LDA").shape, Direct);
    }

    #[test]
    fn test_resolve_width() {
        let t = OpcodeTable::new();
        assert_eq!(
            AddressingModeDetector::resolve(OperandShape::Direct, "LDA", 0x20, &t),
            AddressingMode::ZeroPage
        );
        assert_eq!(
            AddressingModeDetector::resolve(OperandShape::Direct, "LDA", 0x1234, &t),
            AddressingMode::Absolute
        );
        // JSR has no zero-page form, so a small value stays absolute.
        assert_eq!(
            AddressingModeDetector::resolve(OperandShape::Direct, "JSR", 0x20, &t),
            AddressingMode::Absolute
        );
        // LDX $20,Y uses the zero-page,Y form.
        assert_eq!(
            AddressingModeDetector::resolve(OperandShape::DirectY, "LDX", 0x20, &t),
            AddressingMode::ZeroPageY
        );
        // STA $20,Y has no zero-page,Y form.
        assert_eq!(
            AddressingModeDetector::resolve(OperandShape::DirectY, "STA", 0x20, &t),
            AddressingMode::AbsoluteY
        );
    }
}
