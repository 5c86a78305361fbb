//! Multi-module REL linker.
//!
//! Six phases: load, symbol tables from the ESDs, head-to-tail address
//! assignment, external resolution, relocation patching, output
//! generation (BIN / REL / SYS) with an optional load map.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use log::debug;

use super::rel_file::{EsdEntry, RelFile, RldEntry};
use super::symbol_table::SymbolFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Bin,
    Rel,
    Sys,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub output_type: OutputType,
    pub origin: u16,
    pub generate_map: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            output_type: OutputType::Bin,
            origin: 0x0800,
            generate_map: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub output: Vec<u8>,
    pub load_address: u16,
    pub code_length: u16,
    pub load_map: String,
}

/// One loaded input module.
struct Module {
    name: String,
    rel: RelFile,
    load_address: u16,
}

/// A defined (ENTRY) symbol with its final address.
struct EntryRecord {
    address: u16,
    module_index: usize,
}

/// An imported (EXTERNAL) symbol reference, keyed by module and
/// symbol number.
struct ExternRecord {
    name: String,
    module_index: usize,
    symbol_num: u8,
    resolved: Option<u16>,
}

pub struct Linker {
    options: Options,
    modules: Vec<Module>,
    entries: HashMap<String, EntryRecord>,
    entry_order: Vec<String>,
    externs: Vec<ExternRecord>,
}

impl Linker {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            modules: Vec::new(),
            entries: HashMap::new(),
            entry_order: Vec::new(),
            externs: Vec::new(),
        }
    }

    /// Link REL files read from disk.
    pub fn link_files<P: AsRef<Path>>(&mut self, paths: &[P], options: Options) -> LinkResult {
        let mut inputs = Vec::new();
        let mut result = LinkResult::default();
        for path in paths {
            let path = path.as_ref();
            match fs::read(path) {
                Ok(bytes) => inputs.push((path.display().to_string(), bytes)),
                Err(e) => result
                    .errors
                    .push(format!("Cannot read {}: {e}", path.display())),
            }
        }
        if !result.errors.is_empty() {
            return result;
        }
        self.link(&inputs, options)
    }

    /// Link already-loaded REL images. Each input is `(name, bytes)`.
    pub fn link(&mut self, inputs: &[(String, Vec<u8>)], options: Options) -> LinkResult {
        self.options = options;
        self.modules.clear();
        self.entries.clear();
        self.entry_order.clear();
        self.externs.clear();

        let mut result = LinkResult {
            load_address: self.options.origin,
            ..Default::default()
        };

        // Phase 1: parse.
        for (name, bytes) in inputs {
            match RelFile::parse(bytes) {
                Ok(rel) => {
                    debug!("loaded module {name}: {} code bytes", rel.code.len());
                    self.modules.push(Module {
                        name: name.clone(),
                        rel,
                        load_address: 0,
                    });
                }
                Err(e) => result.errors.push(format!("{name}: {e}")),
            }
        }
        if !result.errors.is_empty() {
            return result;
        }

        // Phase 3 before phase 2: entry addresses in the global table
        // are final, so modules must be placed first.
        self.assign_addresses();

        // Phase 2: symbol tables.
        self.build_symbol_tables(&mut result);

        // Phase 4: resolve externals.
        self.resolve_externals(&mut result);

        if !result.errors.is_empty() {
            return result;
        }

        // Phase 5: relocate.
        self.relocate(&mut result);
        if !result.errors.is_empty() {
            return result;
        }

        // Phase 6: output.
        result.output = match self.options.output_type {
            OutputType::Bin | OutputType::Sys => self.build_bin(),
            OutputType::Rel => self.build_rel(),
        };
        result.code_length = self
            .modules
            .iter()
            .map(|m| m.rel.code.len() as u16)
            .fold(0u16, u16::wrapping_add);

        if self.options.generate_map {
            result.load_map = self.build_load_map();
        }

        result.success = result.errors.is_empty();
        result
    }

    fn assign_addresses(&mut self) {
        let mut cursor = self.options.origin;
        for module in &mut self.modules {
            module.load_address = cursor;
            cursor = cursor.wrapping_add(module.rel.code.len() as u16);
        }
    }

    fn build_symbol_tables(&mut self, result: &mut LinkResult) {
        for (index, module) in self.modules.iter().enumerate() {
            for esd in &module.rel.esd {
                if esd.is_entry() {
                    let address = if esd.flags.contains(SymbolFlags::RELATIVE) {
                        esd.address.wrapping_add(module.load_address)
                    } else {
                        esd.address
                    };
                    if self.entries.contains_key(&esd.name) {
                        result.errors.push(format!(
                            "Duplicate entry symbol {} in module {}",
                            esd.name, module.name
                        ));
                        continue;
                    }
                    self.entries.insert(
                        esd.name.clone(),
                        EntryRecord {
                            address,
                            module_index: index,
                        },
                    );
                    self.entry_order.push(esd.name.clone());
                } else if esd.is_external() {
                    self.externs.push(ExternRecord {
                        name: esd.name.clone(),
                        module_index: index,
                        symbol_num: esd.symbol_num,
                        resolved: None,
                    });
                }
            }
        }
    }

    fn resolve_externals(&mut self, result: &mut LinkResult) {
        for ext in &mut self.externs {
            match self.entries.get(&ext.name) {
                Some(entry) => ext.resolved = Some(entry.address),
                None => result.errors.push(format!(
                    "Unresolved external {} (module {})",
                    ext.name, self.modules[ext.module_index].name
                )),
            }
        }
    }

    fn lookup_extern(&self, module_index: usize, symbol_num: u8) -> Option<u16> {
        self.externs
            .iter()
            .find(|e| e.module_index == module_index && e.symbol_num == symbol_num)
            .and_then(|e| e.resolved)
    }

    fn relocate(&mut self, result: &mut LinkResult) {
        for index in 0..self.modules.len() {
            let load_address = self.modules[index].load_address;
            let rld: Vec<RldEntry> = self.modules[index].rel.rld.clone();
            for entry in rld {
                let pos = entry.address as usize;
                if pos + 1 >= self.modules[index].rel.code.len() {
                    result.errors.push(format!(
                        "RLD address ${:04X} outside code in module {}",
                        entry.address, self.modules[index].name
                    ));
                    continue;
                }

                let code = &mut self.modules[index].rel.code;
                let word = code[pos] as u16 | ((code[pos + 1] as u16) << 8);
                let patched = if entry.is_relative() {
                    word.wrapping_add(load_address)
                } else if entry.is_external() {
                    match self.lookup_extern(index, entry.symbol_num) {
                        Some(addr) => addr,
                        None => {
                            result.errors.push(format!(
                                "RLD references unknown external #{} in module {}",
                                entry.symbol_num, self.modules[index].name
                            ));
                            continue;
                        }
                    }
                } else {
                    word
                };

                let code = &mut self.modules[index].rel.code;
                code[pos] = (patched & 0xFF) as u8;
                code[pos + 1] = (patched >> 8) as u8;
            }
        }
    }

    fn build_bin(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for module in &self.modules {
            out.extend_from_slice(&module.rel.code);
        }
        out
    }

    /// Re-serialize as a single REL module: patched code, relative
    /// relocations rebased to the concatenated image, re-exported
    /// entries and any unresolved externals (none once resolution
    /// succeeded).
    fn build_rel(&self) -> Vec<u8> {
        let mut rel = RelFile::default();
        for module in &self.modules {
            let base = (module.load_address.wrapping_sub(self.options.origin)) as u16;
            for entry in &module.rel.rld {
                if entry.is_relative() {
                    rel.rld.push(RldEntry {
                        flags: RldEntry::TYPE_RELATIVE,
                        address: entry.address.wrapping_add(base),
                        symbol_num: 0,
                    });
                }
            }
            rel.code.extend_from_slice(&module.rel.code);
        }

        for name in &self.entry_order {
            let entry = &self.entries[name];
            rel.esd.push(EsdEntry {
                flags: SymbolFlags::ENTRY,
                address: entry.address,
                name: name.clone(),
                symbol_num: 0,
            });
        }

        rel.build()
    }

    fn build_load_map(&self) -> String {
        let mut map = String::new();
        let _ = writeln!(map, "Load map (origin ${:04X})", self.options.origin);
        let _ = writeln!(map, "{:-<48}", "");
        for module in &self.modules {
            let _ = writeln!(
                map,
                "{:<24} ${:04X}  length ${:04X}",
                module.name,
                module.load_address,
                module.rel.code.len()
            );
        }
        let _ = writeln!(map, "{:-<48}", "");

        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        for name in names {
            let entry = &self.entries[name];
            let _ = writeln!(
                map,
                "{:<24} ${:04X}  ({})",
                name, entry.address, self.modules[entry.module_index].name
            );
        }
        map
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}
