//! Two-pass 6502 assembler driver.
//!
//! Pass 0 expands INCLUDE directives. Pass 1 builds the symbol table
//! and sizes every line; pass 2 re-walks the identical sequence and
//! emits code plus relocation records. Errors are collected per line
//! and assembly always runs to the end of the input.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::expression::{ExprResult, ExpressionEvaluator};
use super::opcode_table::{
    AddressingMode, AddressingModeDetector, OpcodeTable, OperandShape,
};
use super::rel_file::{EsdEntry, RelFile, RldEntry};
use super::symbol_table::{SymbolFlags, SymbolTable};
use super::tokenizer::{self, SourceLine};

/// ProDOS file type codes for the assembler output.
pub const FILE_TYPE_BIN: u8 = 0x06;
pub const FILE_TYPE_REL: u8 = 0xFE;

const DEFAULT_ORG: u16 = 0x0800;

/// One collected error or warning, attached to a source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Directory against which INCLUDE paths resolve.
    pub base_path: PathBuf,
    /// Maximum INCLUDE nesting depth.
    pub include_depth_limit: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            include_depth_limit: 16,
        }
    }
}

/// Assembly outcome. `code` is empty unless `success`.
#[derive(Debug, Default)]
pub struct AsmResult {
    pub success: bool,
    pub errors: Vec<AsmError>,
    pub warnings: Vec<AsmError>,
    pub code: Vec<u8>,
    pub org_address: u16,
    pub code_length: u16,
    /// True when the source used the REL directive.
    pub is_rel: bool,
    /// Serialized REL container (code + RLD + ESD) when `is_rel`.
    pub rel_data: Vec<u8>,
    pub file_type: u8,
}

// ── Conditional assembly ──────────────────────────────────────

/// One DO/ELSE/FIN nesting frame.
struct CondFrame {
    active: bool,
    parent_active: bool,
    seen_else: bool,
}

struct CondState {
    stack: Vec<CondFrame>,
}

impl CondState {
    fn new() -> Self {
        Self { stack: Vec::new() }
    }

    fn assembling(&self) -> bool {
        self.stack.iter().all(|f| f.active)
    }

    fn push(&mut self, condition: bool) {
        let parent_active = self.assembling();
        self.stack.push(CondFrame {
            active: condition,
            parent_active,
            seen_else: false,
        });
    }

    fn flip_else(&mut self) -> Result<(), String> {
        match self.stack.last_mut() {
            None => Err("ELSE without matching DO".to_string()),
            Some(f) if f.seen_else => Err("Duplicate ELSE in conditional".to_string()),
            Some(f) => {
                f.seen_else = true;
                f.active = f.parent_active && !f.active;
                Ok(())
            }
        }
    }

    fn pop(&mut self) -> Result<(), String> {
        match self.stack.pop() {
            None => Err("FIN without matching DO".to_string()),
            Some(_) => Ok(()),
        }
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }
}

// ── Assembler ─────────────────────────────────────────────────

pub struct Assembler {
    symbols: SymbolTable,
    opcodes: OpcodeTable,
    options: Options,

    pc: u16,
    org: u16,
    org_seen: bool,

    rel_mode: bool,
    file_type: u8,
    msb_on: bool,
    listing_enabled: bool,
    next_extern_num: u8,

    /// Addressing mode chosen for each line in pass 1, so pass 2
    /// encodes identical lengths even across forward references.
    line_modes: Vec<Option<AddressingMode>>,
    /// Relocation records collected during pass 2.
    pending_rld: Vec<RldEntry>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            opcodes: OpcodeTable::new(),
            options: Options::default(),
            pc: DEFAULT_ORG,
            org: DEFAULT_ORG,
            org_seen: false,
            rel_mode: false,
            file_type: FILE_TYPE_BIN,
            msb_on: false,
            listing_enabled: true,
            next_extern_num: 0,
            line_modes: Vec::new(),
            pending_rld: Vec::new(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn assemble(&mut self, source: &str, options: Options) -> AsmResult {
        self.reset();
        self.options = options;

        let mut result = AsmResult {
            org_address: DEFAULT_ORG,
            file_type: FILE_TYPE_BIN,
            ..Default::default()
        };

        let mut lines: Vec<SourceLine> = source
            .lines()
            .enumerate()
            .map(|(i, text)| tokenizer::parse_line(text, i as u32 + 1))
            .collect();

        let mut include_stack = Vec::new();
        lines = self.preprocess_includes(lines, &mut result, 0, &mut include_stack);
        if !result.errors.is_empty() {
            return result;
        }

        self.line_modes = vec![None; lines.len()];

        self.pass1(&lines, &mut result);
        self.pass2(&lines, &mut result);

        result.org_address = self.org;
        result.is_rel = self.rel_mode;
        result.file_type = self.file_type;
        result.success = result.errors.is_empty();
        if result.success {
            result.code_length = result.code.len() as u16;
            if self.rel_mode {
                let rel = self.build_rel(&result.code);
                result.rel_data = rel.build();
            }
        } else {
            result.code.clear();
        }
        result
    }

    fn reset(&mut self) {
        self.symbols.reset();
        self.pc = DEFAULT_ORG;
        self.org = DEFAULT_ORG;
        self.org_seen = false;
        self.rel_mode = false;
        self.file_type = FILE_TYPE_BIN;
        self.msb_on = false;
        self.listing_enabled = true;
        self.next_extern_num = 0;
        self.line_modes.clear();
        self.pending_rld.clear();
    }

    // ── Pass 0: include expansion ─────────────────────────────

    fn preprocess_includes(
        &self,
        lines: Vec<SourceLine>,
        result: &mut AsmResult,
        depth: u32,
        stack: &mut Vec<PathBuf>,
    ) -> Vec<SourceLine> {
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            if line.mnemonic != "INCLUDE" {
                out.push(line);
                continue;
            }

            if depth >= self.options.include_depth_limit {
                error(result, line.line_number, "Include nesting too deep");
                continue;
            }

            let path = self.resolve_include_path(strip_quotes(&line.operand));
            if stack.contains(&path) {
                error(
                    result,
                    line.line_number,
                    &format!("Circular include: {}", path.display()),
                );
                continue;
            }

            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    error(
                        result,
                        line.line_number,
                        &format!("Cannot include {}: {e}", path.display()),
                    );
                    continue;
                }
            };
            debug!("including {} ({} bytes)", path.display(), text.len());

            let included: Vec<SourceLine> = text
                .lines()
                .enumerate()
                .map(|(i, t)| tokenizer::parse_line(t, i as u32 + 1))
                .collect();

            stack.push(path);
            let mut expanded = self.preprocess_includes(included, result, depth + 1, stack);
            stack.pop();
            out.append(&mut expanded);
        }
        out
    }

    fn resolve_include_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.options.base_path.join(p)
        }
    }

    // ── Pass 1: symbols and sizing ────────────────────────────

    fn pass1(&mut self, lines: &[SourceLine], result: &mut AsmResult) {
        let mut cond = CondState::new();

        for (idx, line) in lines.iter().enumerate() {
            if line.is_comment_only() {
                continue;
            }

            // Conditional directives are tracked even while skipping,
            // so nesting stays balanced.
            if is_conditional(&line.mnemonic) {
                self.process_conditional(line, &mut cond, result);
                continue;
            }
            if !cond.assembling() {
                continue;
            }

            let mnemonic = line.mnemonic.as_str();

            if !line.label.is_empty() && mnemonic != "EQU" && mnemonic != "=" {
                self.define_label(&line.label, self.pc, line.line_number, result);
            }

            if mnemonic.is_empty() {
                continue;
            }

            if is_directive(mnemonic) {
                if self.directive_pass1(line, result) {
                    break; // END
                }
                continue;
            }

            if !self.opcodes.is_mnemonic(mnemonic) {
                error(
                    result,
                    line.line_number,
                    &format!("Unknown mnemonic: {mnemonic}"),
                );
                continue;
            }

            let mode = self.size_instruction(line, result);
            self.line_modes[idx] = Some(mode);
            self.pc = self.pc.wrapping_add(mode.length());
        }

        if cond.depth() != 0 {
            error(result, 0, "Unterminated conditional: DO without FIN");
        }

        // ENTRY implies a concrete definition after pass 1.
        let mut entry_errors = Vec::new();
        for sym in self.symbols.iter() {
            if sym.flags.contains(SymbolFlags::ENTRY) {
                if sym.flags.contains(SymbolFlags::EXTERNAL) {
                    entry_errors.push((
                        sym.line_defined,
                        format!("Symbol {} cannot be both ENT and EXT", sym.name),
                    ));
                }
                if sym.flags.contains(SymbolFlags::UNDEFINED) {
                    entry_errors.push((
                        sym.line_defined,
                        format!("Entry symbol {} is never defined", sym.name),
                    ));
                }
            }
        }
        for (line, msg) in entry_errors {
            error(result, line, &msg);
        }
    }

    /// Determine the addressing mode (and hence length) of one
    /// instruction. Forward references and relocatable operands are
    /// forced wide so both passes agree.
    fn size_instruction(&mut self, line: &SourceLine, result: &mut AsmResult) -> AddressingMode {
        let det = AddressingModeDetector::detect(&line.operand, &line.mnemonic);
        let mode = match det.shape {
            OperandShape::Direct | OperandShape::DirectX | OperandShape::DirectY => {
                let eval = ExpressionEvaluator::new(&self.symbols);
                match eval.evaluate(&det.expr, 1) {
                    Ok(r) if r.is_forward_ref || r.is_relative || r.is_external => {
                        AddressingModeDetector::resolve(det.shape, &line.mnemonic, 0x100, &self.opcodes)
                    }
                    Ok(r) => {
                        AddressingModeDetector::resolve(det.shape, &line.mnemonic, r.value, &self.opcodes)
                    }
                    Err(e) => {
                        error(result, line.line_number, &e);
                        AddressingModeDetector::resolve(det.shape, &line.mnemonic, 0x100, &self.opcodes)
                    }
                }
            }
            shape => AddressingModeDetector::resolve(shape, &line.mnemonic, 0, &self.opcodes),
        };
        if self.opcodes.lookup(&line.mnemonic, mode).is_none() {
            error(
                result,
                line.line_number,
                &format!("Invalid addressing mode for {}", line.mnemonic),
            );
        }
        mode
    }

    /// Define a label, tolerating redefinition only of placeholder
    /// symbols created by ENT ahead of their definition.
    fn define_label(&mut self, name: &str, value: u16, line: u32, result: &mut AsmResult) {
        let mut flags = SymbolFlags::UNREFERENCED;
        if self.rel_mode {
            flags |= SymbolFlags::RELATIVE;
        }

        if let Some(sym) = self.symbols.lookup(name) {
            if sym.flags.contains(SymbolFlags::UNDEFINED) {
                self.symbols.update_value(name, value);
                self.symbols.update_flags(name, flags, SymbolFlags::UNDEFINED);
            } else {
                error(
                    result,
                    line,
                    &format!(
                        "Duplicate symbol {name} (first defined at line {})",
                        sym.line_defined
                    ),
                );
            }
            return;
        }

        // Cannot fail: lookup above returned None.
        let _ = self.symbols.define(name, value, flags, line);
    }

    /// Apply a directive's pass-1 effect. Returns true on END.
    fn directive_pass1(&mut self, line: &SourceLine, result: &mut AsmResult) -> bool {
        match line.mnemonic.as_str() {
            "ORG" => {
                match self.eval(&line.operand, 1) {
                    Ok(r) => {
                        self.pc = r.value;
                        if !self.org_seen {
                            self.org = r.value;
                            self.org_seen = true;
                        }
                    }
                    Err(e) => error(result, line.line_number, &e),
                }
            }
            "EQU" | "=" => {
                if line.label.is_empty() {
                    error(result, line.line_number, "EQU requires a label");
                    return false;
                }
                match self.eval(&line.operand, 1) {
                    Ok(r) => {
                        let mut flags = SymbolFlags::UNREFERENCED;
                        if r.is_relative {
                            flags |= SymbolFlags::RELATIVE;
                        }
                        if let Some(sym) = self.symbols.lookup(&line.label) {
                            if sym.flags.contains(SymbolFlags::UNDEFINED) {
                                self.symbols.update_value(&line.label, r.value);
                                self.symbols.update_flags(
                                    &line.label,
                                    flags,
                                    SymbolFlags::UNDEFINED,
                                );
                            } else {
                                error(
                                    result,
                                    line.line_number,
                                    &format!("Duplicate symbol {}", line.label),
                                );
                            }
                        } else {
                            let _ = self.symbols.define(&line.label, r.value, flags, line.line_number);
                        }
                    }
                    Err(e) => error(result, line.line_number, &e),
                }
            }
            "DB" => {
                let count = split_operands(&line.operand).len() as u16;
                self.pc = self.pc.wrapping_add(count);
            }
            "DW" | "DA" => {
                let count = split_operands(&line.operand).len() as u16;
                self.pc = self.pc.wrapping_add(count * 2);
            }
            "DS" => match self.eval(&line.operand, 1) {
                Ok(r) => self.pc = self.pc.wrapping_add(r.value),
                Err(e) => error(result, line.line_number, &e),
            },
            "ASC" | "DCI" => match parse_string(&line.operand) {
                Ok(s) => self.pc = self.pc.wrapping_add(s.len() as u16),
                Err(e) => error(result, line.line_number, &e),
            },
            "REL" => {
                self.rel_mode = true;
                self.file_type = FILE_TYPE_REL;
                // Relocatable modules assemble from a zero base; the
                // linker supplies the real origin.
                if !self.org_seen {
                    self.pc = 0;
                    self.org = 0;
                }
            }
            "ENT" => {
                let name = ent_ext_name(line);
                if name.is_empty() {
                    error(result, line.line_number, "ENT requires a symbol name");
                } else if self.symbols.lookup(name).is_some() {
                    self.symbols.update_flags(name, SymbolFlags::ENTRY, SymbolFlags::empty());
                } else {
                    let _ = self.symbols.define(
                        name,
                        0,
                        SymbolFlags::ENTRY | SymbolFlags::UNDEFINED | SymbolFlags::UNREFERENCED,
                        line.line_number,
                    );
                }
            }
            "EXT" => {
                let name = ent_ext_name(line);
                if name.is_empty() {
                    error(result, line.line_number, "EXT requires a symbol name");
                } else if self.symbols.lookup(name).is_some() {
                    error(
                        result,
                        line.line_number,
                        &format!("Duplicate symbol {name}"),
                    );
                } else {
                    let _ = self.symbols.define(
                        name,
                        0,
                        SymbolFlags::EXTERNAL | SymbolFlags::UNDEFINED | SymbolFlags::UNREFERENCED,
                        line.line_number,
                    );
                    self.symbols.set_symbol_number(name, self.next_extern_num);
                    self.next_extern_num = self.next_extern_num.wrapping_add(1);
                }
            }
            "LST" => self.listing_enabled = parse_on_off(&line.operand, self.listing_enabled),
            "MSB" => self.msb_on = parse_on_off(&line.operand, self.msb_on),
            "END" => return true,
            _ => {}
        }
        false
    }

    // ── Pass 2: emission ──────────────────────────────────────

    fn pass2(&mut self, lines: &[SourceLine], result: &mut AsmResult) {
        self.pc = self.org;
        self.msb_on = false;
        self.listing_enabled = true;
        let mut cond = CondState::new();
        let mut rld: Vec<RldEntry> = Vec::new();

        let mut code = std::mem::take(&mut result.code);

        for (idx, line) in lines.iter().enumerate() {
            if line.is_comment_only() {
                continue;
            }
            if is_conditional(&line.mnemonic) {
                // Recomputed identically to pass 1; errors were
                // already reported there.
                let mut scratch = AsmResult::default();
                self.process_conditional(line, &mut cond, &mut scratch);
                continue;
            }
            if !cond.assembling() {
                continue;
            }

            let mnemonic = line.mnemonic.as_str();
            if mnemonic.is_empty() {
                continue;
            }

            if is_directive(mnemonic) {
                if self.directive_pass2(line, result, &mut code, &mut rld) {
                    break; // END
                }
                continue;
            }

            if !self.opcodes.is_mnemonic(mnemonic) {
                continue; // reported in pass 1
            }

            self.encode_instruction(line, self.line_modes[idx], result, &mut code, &mut rld);
        }

        result.code = code;
        self.pending_rld = rld;
    }

    fn encode_instruction(
        &mut self,
        line: &SourceLine,
        recorded_mode: Option<AddressingMode>,
        result: &mut AsmResult,
        code: &mut Vec<u8>,
        rld: &mut Vec<RldEntry>,
    ) {
        let det = AddressingModeDetector::detect(&line.operand, &line.mnemonic);
        let mode = match recorded_mode {
            Some(m) => m,
            None => AddressingModeDetector::resolve(det.shape, &line.mnemonic, 0x100, &self.opcodes),
        };

        let opcode = match self.opcodes.lookup(&line.mnemonic, mode) {
            Some(op) => *op,
            None => return, // reported in pass 1
        };

        let operand = if det.expr.is_empty() {
            None
        } else {
            match self.eval(&det.expr, 2) {
                Ok(r) => {
                    for name in &r.refs {
                        self.symbols.mark_referenced(name);
                    }
                    Some(r)
                }
                Err(e) => {
                    error(result, line.line_number, &e);
                    self.pc = self.pc.wrapping_add(opcode.length);
                    return;
                }
            }
        };

        code.push(opcode.code);

        use AddressingMode::*;
        match mode {
            Implied | Accumulator => {}
            Immediate | ZeroPage | ZeroPageX | ZeroPageY | IndexedIndirect | IndirectIndexed => {
                let value = operand.as_ref().map_or(0, |r| r.value);
                code.push((value & 0xFF) as u8);
            }
            Relative => {
                let target = operand.as_ref().map_or(0, |r| r.value);
                let after = self.pc.wrapping_add(2);
                // Wrapping 16-bit distance, so page-edge branches work.
                let diff = target.wrapping_sub(after);
                if diff <= 0x007F || diff >= 0xFF80 {
                    code.push(diff as u8);
                } else {
                    error(result, line.line_number, "Branch out of range");
                    code.push(0);
                }
            }
            Absolute | AbsoluteX | AbsoluteY | Indirect => {
                let r = operand.unwrap_or_default();
                self.emit_word_with_reloc(&r, code, rld, result, line.line_number);
            }
        }

        self.pc = self.pc.wrapping_add(opcode.length);
    }

    fn emit_word_with_reloc(
        &mut self,
        r: &ExprResult,
        code: &mut Vec<u8>,
        rld: &mut Vec<RldEntry>,
        result: &mut AsmResult,
        line: u32,
    ) {
        if self.rel_mode {
            if r.is_external {
                match self.external_symbol_number(r) {
                    Some(num) => rld.push(RldEntry {
                        flags: RldEntry::TYPE_EXTERNAL,
                        address: code.len() as u16,
                        symbol_num: num,
                    }),
                    None => error(result, line, "External reference lost its symbol"),
                }
            } else if r.is_relative {
                rld.push(RldEntry {
                    flags: RldEntry::TYPE_RELATIVE,
                    address: code.len() as u16,
                    symbol_num: 0,
                });
            }
        }
        code.push((r.value & 0xFF) as u8);
        code.push((r.value >> 8) as u8);
    }

    fn external_symbol_number(&self, r: &ExprResult) -> Option<u8> {
        r.refs.iter().find_map(|name| {
            self.symbols
                .lookup(name)
                .filter(|s| s.flags.contains(SymbolFlags::EXTERNAL))
                .map(|s| s.symbol_number)
        })
    }

    /// Apply a directive's pass-2 effect. Returns true on END.
    fn directive_pass2(
        &mut self,
        line: &SourceLine,
        result: &mut AsmResult,
        code: &mut Vec<u8>,
        rld: &mut Vec<RldEntry>,
    ) -> bool {
        match line.mnemonic.as_str() {
            "ORG" => {
                if let Ok(r) = self.eval(&line.operand, 2) {
                    self.pc = r.value;
                }
            }
            "EQU" | "=" => {}
            "DB" => {
                for part in split_operands(&line.operand) {
                    match self.eval(&part, 2) {
                        Ok(r) => {
                            for name in &r.refs {
                                self.symbols.mark_referenced(name);
                            }
                            code.push((r.value & 0xFF) as u8);
                        }
                        Err(e) => {
                            error(result, line.line_number, &e);
                            code.push(0);
                        }
                    }
                    self.pc = self.pc.wrapping_add(1);
                }
            }
            "DW" | "DA" => {
                for part in split_operands(&line.operand) {
                    match self.eval(&part, 2) {
                        Ok(r) => {
                            for name in &r.refs {
                                self.symbols.mark_referenced(name);
                            }
                            self.emit_word_with_reloc(&r, code, rld, result, line.line_number);
                        }
                        Err(e) => {
                            error(result, line.line_number, &e);
                            code.push(0);
                            code.push(0);
                        }
                    }
                    self.pc = self.pc.wrapping_add(2);
                }
            }
            "DS" => {
                if let Ok(r) = self.eval(&line.operand, 2) {
                    for _ in 0..r.value {
                        code.push(0);
                    }
                    self.pc = self.pc.wrapping_add(r.value);
                }
            }
            "ASC" => match parse_string(&line.operand) {
                Ok(s) => {
                    for b in s.bytes() {
                        code.push(if self.msb_on { b | 0x80 } else { b });
                    }
                    self.pc = self.pc.wrapping_add(s.len() as u16);
                }
                Err(_) => {} // reported in pass 1
            },
            "DCI" => match parse_string(&line.operand) {
                Ok(s) => {
                    let bytes: Vec<u8> = s.bytes().collect();
                    let last = bytes.len().saturating_sub(1);
                    for (i, b) in bytes.iter().enumerate() {
                        let mut byte = if self.msb_on { b | 0x80 } else { *b };
                        if i == last {
                            byte ^= 0x80;
                        }
                        code.push(byte);
                    }
                    self.pc = self.pc.wrapping_add(bytes.len() as u16);
                }
                Err(_) => {}
            },
            "REL" => {}
            "ENT" | "EXT" => {}
            "LST" => self.listing_enabled = parse_on_off(&line.operand, self.listing_enabled),
            "MSB" => self.msb_on = parse_on_off(&line.operand, self.msb_on),
            "END" => return true,
            _ => {}
        }
        false
    }

    fn process_conditional(
        &mut self,
        line: &SourceLine,
        cond: &mut CondState,
        result: &mut AsmResult,
    ) {
        match line.mnemonic.as_str() {
            "DO" => {
                // A DO inside a skipped region still nests, but its
                // condition is irrelevant.
                let active = if cond.assembling() {
                    match self.eval(&line.operand, 1) {
                        Ok(r) => r.value != 0,
                        Err(e) => {
                            error(result, line.line_number, &e);
                            false
                        }
                    }
                } else {
                    false
                };
                cond.push(active);
            }
            "ELSE" => {
                if let Err(e) = cond.flip_else() {
                    error(result, line.line_number, &e);
                }
            }
            "FIN" => {
                if let Err(e) = cond.pop() {
                    error(result, line.line_number, &e);
                }
            }
            _ => {}
        }
    }

    fn eval(&self, expr: &str, pass: u8) -> Result<ExprResult, String> {
        ExpressionEvaluator::new(&self.symbols).evaluate(expr, pass)
    }

    /// Assemble the final REL container from the emitted code and the
    /// relocation records collected during pass 2.
    fn build_rel(&self, code: &[u8]) -> RelFile {
        let mut esd = Vec::new();

        let mut entries: Vec<_> = self
            .symbols
            .iter()
            .filter(|s| s.flags.contains(SymbolFlags::ENTRY))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for sym in entries {
            let mut flags = SymbolFlags::ENTRY;
            if sym.flags.contains(SymbolFlags::RELATIVE) {
                flags |= SymbolFlags::RELATIVE;
            }
            esd.push(EsdEntry {
                flags,
                address: sym.value,
                name: sym.name.clone(),
                symbol_num: 0,
            });
        }

        let mut externals: Vec<_> = self
            .symbols
            .iter()
            .filter(|s| s.flags.contains(SymbolFlags::EXTERNAL))
            .collect();
        externals.sort_by_key(|s| s.symbol_number);
        for sym in externals {
            let mut flags = SymbolFlags::EXTERNAL;
            if sym.flags.contains(SymbolFlags::UNDEFINED) {
                flags |= SymbolFlags::UNDEFINED;
            }
            esd.push(EsdEntry {
                flags,
                address: sym.value,
                name: sym.name.clone(),
                symbol_num: sym.symbol_number,
            });
        }

        RelFile {
            code: code.to_vec(),
            rld: self.pending_rld.clone(),
            esd,
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn error(result: &mut AsmResult, line: u32, message: &str) {
    result.errors.push(AsmError {
        line,
        message: message.to_string(),
    });
}

const DIRECTIVES: &[&str] = &[
    "ORG", "EQU", "=", "DB", "DW", "DA", "DS", "ASC", "DCI", "REL", "ENT", "EXT", "LST", "MSB",
    "END",
];

fn is_directive(mnemonic: &str) -> bool {
    DIRECTIVES.contains(&mnemonic)
}

fn is_conditional(mnemonic: &str) -> bool {
    mnemonic == "DO" || mnemonic == "ELSE" || mnemonic == "FIN"
}

fn ent_ext_name(line: &SourceLine) -> &str {
    if !line.operand.is_empty() {
        &line.operand
    } else {
        &line.label
    }
}

fn parse_on_off(operand: &str, current: bool) -> bool {
    match operand.trim().to_ascii_uppercase().as_str() {
        "ON" => true,
        "OFF" => false,
        _ => current,
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
        {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Parse an ASC/DCI operand: a string delimited by matching quote
/// characters.
fn parse_string(operand: &str) -> Result<String, String> {
    let s = operand.trim();
    let mut chars = s.chars();
    let delim = match chars.next() {
        Some(c @ ('"' | '\'')) => c,
        _ => return Err("String literal expected".to_string()),
    };
    let rest: String = chars.collect();
    match rest.rfind(delim) {
        Some(end) => Ok(rest[..end].to_string()),
        None => Err("Unterminated string literal".to_string()),
    }
}

/// Split a DB/DW operand list on commas outside quotes.
fn split_operands(operand: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in operand.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ',' => {
                    parts.push(current.trim().to_string());
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts.retain(|p| !p.is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(source: &str) -> AsmResult {
        Assembler::new().assemble(source, Options::default())
    }

    #[test]
    fn test_tiny_program() {
        let r = asm("\tORG $1000\nSTART\tLDA #$42\n\tSTA $20\n\tRTS\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(r.code, vec![0xA9, 0x42, 0x85, 0x20, 0x60]);
        assert_eq!(r.org_address, 0x1000);
    }

    #[test]
    fn test_symbol_value() {
        let mut a = Assembler::new();
        let r = a.assemble("\tORG $1000\nSTART\tLDA #$42\n\tEND\n", Options::default());
        assert!(r.success);
        assert_eq!(a.symbols().lookup("START").unwrap().value, 0x1000);
    }

    #[test]
    fn test_forward_reference() {
        let r = asm("\tORG $1000\nSTART\tJMP LATER\n\tNOP\nLATER\tRTS\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(r.code, vec![0x4C, 0x04, 0x10, 0xEA, 0x60]);
    }

    #[test]
    fn test_msb_asc() {
        let r = asm(
            "\tORG $1000\n\tASC \"AB\"\n\tMSB ON\n\tASC \"AB\"\n\tMSB OFF\n\tASC \"AB\"\n\tEND\n",
        );
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(r.code, vec![0x41, 0x42, 0xC1, 0xC2, 0x41, 0x42]);
    }

    #[test]
    fn test_dci_inverts_last_byte_only() {
        let r = asm("\tORG $1000\n\tDCI \"AB\"\n\tEND\n");
        assert!(r.success);
        assert_eq!(r.code, vec![0x41, 0xC2]);

        // DCI inverts regardless of MSB: with MSB on, the last byte
        // flips back to clear.
        let r = asm("\tORG $1000\n\tMSB ON\n\tDCI \"AB\"\n\tEND\n");
        assert!(r.success);
        assert_eq!(r.code, vec![0xC1, 0x42]);
    }

    #[test]
    fn test_equ_and_expressions() {
        let r = asm("VAL\tEQU $30\n\tORG $1000\n\tLDA #VAL+2\n\tSTA VAL\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(r.code, vec![0xA9, 0x32, 0x85, 0x30]);
    }

    #[test]
    fn test_db_dw_ds() {
        let r = asm("\tORG $1000\n\tDB 1,2,$FF\n\tDW $1234,$AABB\n\tDS 3\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(
            r.code,
            vec![1, 2, 0xFF, 0x34, 0x12, 0xBB, 0xAA, 0, 0, 0]
        );
    }

    #[test]
    fn test_branch_encoding() {
        let r = asm("\tORG $1000\nLOOP\tDEX\n\tBNE LOOP\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        // BNE back to $1000 from $1003: offset -3 = $FD.
        assert_eq!(r.code, vec![0xCA, 0xD0, 0xFD]);
    }

    #[test]
    fn test_branch_across_address_wrap() {
        // Branch near the top of memory to a target past the wrap:
        // distance is small only under wrapping 16-bit arithmetic.
        let r = asm("TARGET\tEQU $0005\n\tORG $FFF0\n\tBNE TARGET\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        // $0005 - $FFF2 = $13 with wrap.
        assert_eq!(r.code, vec![0xD0, 0x13]);
    }

    #[test]
    fn test_branch_out_of_range() {
        let r = asm("\tORG $1000\nSTART\tNOP\n\tDS 200\n\tBNE START\n\tEND\n");
        assert!(!r.success);
        assert!(r
            .errors
            .iter()
            .any(|e| e.message.contains("Branch out of range")));
        assert!(r.code.is_empty());
    }

    #[test]
    fn test_conditional_assembly() {
        let r = asm("FLAG\tEQU 1\n\tORG $1000\n\tDO FLAG\n\tLDA #1\n\tELSE\n\tLDA #2\n\tFIN\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(r.code, vec![0xA9, 0x01]);

        let r = asm("FLAG\tEQU 0\n\tORG $1000\n\tDO FLAG\n\tLDA #1\n\tELSE\n\tLDA #2\n\tFIN\n\tEND\n");
        assert!(r.success);
        assert_eq!(r.code, vec![0xA9, 0x02]);
    }

    #[test]
    fn test_unterminated_conditional() {
        let r = asm("\tORG $1000\n\tDO 1\n\tNOP\n\tEND\n");
        assert!(!r.success);
        assert!(r
            .errors
            .iter()
            .any(|e| e.message.contains("Unterminated conditional")));
    }

    #[test]
    fn test_duplicate_symbol_is_error() {
        let r = asm("\tORG $1000\nX\tNOP\nX\tNOP\n\tEND\n");
        assert!(!r.success);
        assert!(r.errors.iter().any(|e| e.message.contains("Duplicate symbol")));
    }

    #[test]
    fn test_undefined_symbol_is_error() {
        let r = asm("\tORG $1000\n\tLDA MISSING\n\tEND\n");
        assert!(!r.success);
        assert!(r
            .errors
            .iter()
            .any(|e| e.message.contains("Undefined symbol: MISSING")));
    }

    #[test]
    fn test_errors_collected_to_end() {
        let r = asm("\tORG $1000\n\tLDA ONE\n\tLDA TWO\n\tEND\n");
        assert_eq!(r.errors.len(), 2);
    }

    #[test]
    fn test_rel_module_output() {
        let src = "\tREL\n\tEXT PUTC\nMAIN\tENT\n\tJSR PUTC\nHERE\tLDA MAIN\n\tRTS\n\tEND\n";
        let r = asm(src);
        assert!(r.success, "errors: {:?}", r.errors);
        assert!(r.is_rel);
        assert_eq!(r.file_type, FILE_TYPE_REL);

        let rel = RelFile::parse(&r.rel_data).unwrap();
        assert_eq!(rel.code.len(), r.code.len());
        // JSR PUTC at offset 0 patches the word at offset 1 (external);
        // LDA MAIN patches the word at offset 4 (relative).
        assert_eq!(rel.rld.len(), 2);
        assert!(rel.rld.iter().any(|e| e.is_external() && e.address == 1));
        assert!(rel.rld.iter().any(|e| e.is_relative() && e.address == 4));

        assert!(rel.esd.iter().any(|e| e.name == "MAIN" && e.is_entry()));
        assert!(rel.esd.iter().any(|e| e.name == "PUTC" && e.is_external()));
    }

    #[test]
    fn test_zero_page_vs_absolute() {
        let r = asm("\tORG $1000\n\tLDA $20\n\tLDA $1234\n\tEND\n");
        assert!(r.success);
        assert_eq!(r.code, vec![0xA5, 0x20, 0xAD, 0x34, 0x12]);
    }

    #[test]
    fn test_indexed_modes() {
        let r = asm("\tORG $1000\n\tLDA $20,X\n\tLDA $1234,Y\n\tLDA ($20,X)\n\tLDA ($20),Y\n\tJMP ($1234)\n\tEND\n");
        assert!(r.success, "errors: {:?}", r.errors);
        assert_eq!(
            r.code,
            vec![0xB5, 0x20, 0xB9, 0x34, 0x12, 0xA1, 0x20, 0xB1, 0x20, 0x6C, 0x34, 0x12]
        );
    }

    #[test]
    fn test_no_output_on_failure() {
        let r = asm("\tORG $1000\n\tLDA MISSING\n\tRTS\n\tEND\n");
        assert!(!r.success);
        assert!(r.code.is_empty());
    }
}
