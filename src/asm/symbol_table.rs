//! Assembler symbol table: name → (value, flags, defining line).
//!
//! Flag bits mirror the on-disk ESD flag byte so symbols serialize
//! without translation.

use std::collections::HashMap;

use bitflags::bitflags;

bitflags! {
    /// Symbol attribute flags. Bit layout matches the REL file's ESD
    /// flag byte.
    pub struct SymbolFlags: u8 {
        const UNDEFINED    = 0x80;
        const UNREFERENCED = 0x40;
        const RELATIVE     = 0x20;
        const EXTERNAL     = 0x10;
        const ENTRY        = 0x08;
        const MACRO        = 0x04;
        const NOSUCHLABEL  = 0x02;
        const FORWARD_REF  = 0x01;
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u16,
    pub flags: SymbolFlags,
    pub line_defined: u32,
    /// Sequence number assigned to external symbols, referenced from
    /// RLD records.
    pub symbol_number: u8,
}

/// Name-keyed symbol store. Symbols are never removed; duplicate
/// definition is rejected (the caller reports it as an error).
#[derive(Debug, Default)]
pub struct SymbolTable {
    table: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.table.clear();
    }

    /// Define a symbol. Returns `Err` with the previous definition's
    /// line number if the name already exists.
    pub fn define(
        &mut self,
        name: &str,
        value: u16,
        flags: SymbolFlags,
        line: u32,
    ) -> Result<(), u32> {
        if let Some(prev) = self.table.get(name) {
            return Err(prev.line_defined);
        }
        self.table.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                value,
                flags,
                line_defined: line,
                symbol_number: 0,
            },
        );
        Ok(())
    }

    pub fn update_value(&mut self, name: &str, value: u16) {
        if let Some(sym) = self.table.get_mut(name) {
            sym.value = value;
        }
    }

    /// OR extra flags into a symbol, clearing UNDEFINED when a concrete
    /// value arrives separately via `update_value`.
    pub fn update_flags(&mut self, name: &str, set: SymbolFlags, clear: SymbolFlags) {
        if let Some(sym) = self.table.get_mut(name) {
            sym.flags.insert(set);
            sym.flags.remove(clear);
        }
    }

    pub fn set_symbol_number(&mut self, name: &str, num: u8) {
        if let Some(sym) = self.table.get_mut(name) {
            sym.symbol_number = num;
        }
    }

    pub fn mark_referenced(&mut self, name: &str) {
        if let Some(sym) = self.table.get_mut(name) {
            sym.flags.remove(SymbolFlags::UNREFERENCED);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.table.get(name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.table.values()
    }

    pub fn sorted_by_name(&self) -> Vec<&Symbol> {
        let mut syms: Vec<&Symbol> = self.table.values().collect();
        syms.sort_by(|a, b| a.name.cmp(&b.name));
        syms
    }

    /// Sorted by value, name breaking ties.
    pub fn sorted_by_value(&self) -> Vec<&Symbol> {
        let mut syms: Vec<&Symbol> = self.table.values().collect();
        syms.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.name.cmp(&b.name)));
        syms
    }
}
