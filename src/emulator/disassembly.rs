//! Single-instruction disassembler for trace output and halt
//! diagnostics, plus a registry of well-known address symbols.

use std::collections::BTreeMap;

use crate::asm::opcode_table::{AddressingMode, OpcodeTable};

use super::bus::BankedMemory;

struct OpcodeInfo {
    mnemonic: &'static str,
    mode: AddressingMode,
}

/// 256-entry decode table, inverted from the assembler's encoder so
/// both pipelines share one opcode vocabulary.
pub struct Disassembler {
    table: Vec<Option<OpcodeInfo>>,
}

impl Disassembler {
    pub fn new() -> Self {
        let mut table: Vec<Option<OpcodeInfo>> = (0..256).map(|_| None).collect();
        let opcodes = OpcodeTable::new();
        for op in opcodes.entries() {
            table[op.code as usize] = Some(OpcodeInfo {
                mnemonic: op.mnemonic,
                mode: op.mode,
            });
        }
        Self { table }
    }

    /// Instruction length in bytes; unknown opcodes report 1.
    pub fn length(&self, opcode: u8) -> u16 {
        self.table[opcode as usize]
            .as_ref()
            .map_or(1, |info| info.mode.length())
    }

    /// Format the instruction at `pc` as raw bytes plus mnemonic, e.g.
    /// `A9 42     LDA #$42`. Reads go through the bank projection but
    /// not the trap layer, so tracing has no side effects.
    pub fn format_instruction(&self, mem: &BankedMemory, pc: u16) -> String {
        let opcode = mem.read(pc);
        let info = match &self.table[opcode as usize] {
            Some(info) => info,
            None => return format!("{opcode:02X}        ???"),
        };

        let b1 = mem.read(pc.wrapping_add(1));
        let b2 = mem.read(pc.wrapping_add(2));
        let word = b1 as u16 | ((b2 as u16) << 8);

        use AddressingMode::*;
        let (bytes, operand) = match info.mode {
            Implied => (format!("{opcode:02X}"), String::new()),
            Accumulator => (format!("{opcode:02X}"), "A".to_string()),
            Immediate => (format!("{opcode:02X} {b1:02X}"), format!("#${b1:02X}")),
            ZeroPage => (format!("{opcode:02X} {b1:02X}"), format!("${b1:02X}")),
            ZeroPageX => (format!("{opcode:02X} {b1:02X}"), format!("${b1:02X},X")),
            ZeroPageY => (format!("{opcode:02X} {b1:02X}"), format!("${b1:02X},Y")),
            Absolute => (format!("{opcode:02X} {b1:02X} {b2:02X}"), format!("${word:04X}")),
            AbsoluteX => (
                format!("{opcode:02X} {b1:02X} {b2:02X}"),
                format!("${word:04X},X"),
            ),
            AbsoluteY => (
                format!("{opcode:02X} {b1:02X} {b2:02X}"),
                format!("${word:04X},Y"),
            ),
            Indirect => (
                format!("{opcode:02X} {b1:02X} {b2:02X}"),
                format!("(${word:04X})"),
            ),
            IndexedIndirect => (format!("{opcode:02X} {b1:02X}"), format!("(${b1:02X},X)")),
            IndirectIndexed => (format!("{opcode:02X} {b1:02X}"), format!("(${b1:02X}),Y")),
            Relative => {
                let target = pc.wrapping_add(2).wrapping_add(b1 as i8 as i16 as u16);
                (format!("{opcode:02X} {b1:02X}"), format!("${target:04X}"))
            }
        };

        if operand.is_empty() {
            format!("{bytes:<9} {}", info.mnemonic)
        } else {
            format!("{bytes:<9} {} {operand}", info.mnemonic)
        }
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Address symbols ───────────────────────────────────────────

/// Address → name map used to annotate trap statistics and traces.
/// Last registration wins.
pub struct SymbolRegistry {
    map: BTreeMap<u16, String>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Registry pre-seeded with the monitor and ProDOS entry points the
    /// system binary is known to touch.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(0xBF00, "PRODOS.MLI");
        reg.register(0xC000, "KBD");
        reg.register(0xC010, "KBDSTRB");
        reg.register(0xC030, "SPKR");
        reg.register(0xFC58, "HOME");
        reg.register(0xFD0C, "RDKEY");
        reg.register(0xFD8E, "CROUT");
        reg.register(0xFDED, "COUT");
        reg.register(0xFE84, "SETNORM");
        reg.register(0xFFFC, "RESETVEC");
        reg
    }

    pub fn register(&mut self, address: u16, name: &str) {
        self.map.insert(address, name.to_string());
    }

    pub fn lookup(&self, address: u16) -> Option<&str> {
        self.map.get(&address).map(String::as_str)
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
