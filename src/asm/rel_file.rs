//! REL relocatable object container: length-prefixed code image,
//! relocation dictionary (RLD) and external symbol dictionary (ESD).
//!
//! The `$00` byte that terminates the RLD section is indistinguishable
//! from an absolute-flagged record, so absolute records are never
//! written.

use super::symbol_table::SymbolFlags;

/// One relocation record: a 16-bit word at `address` inside the code
/// image needs adjustment at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RldEntry {
    pub flags: u8,
    pub address: u16,
    pub symbol_num: u8,
}

impl RldEntry {
    pub const TYPE_ABSOLUTE: u8 = 0x00;
    pub const TYPE_RELATIVE: u8 = 0x01;
    pub const TYPE_EXTERNAL: u8 = 0x02;

    pub fn is_relative(&self) -> bool {
        self.flags == Self::TYPE_RELATIVE
    }

    pub fn is_external(&self) -> bool {
        self.flags == Self::TYPE_EXTERNAL
    }

    fn to_bytes(self) -> [u8; 4] {
        [
            self.flags,
            (self.address & 0xFF) as u8,
            (self.address >> 8) as u8,
            self.symbol_num,
        ]
    }
}

/// One external-symbol record: an exported entry point or an imported
/// external, with a p-string name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsdEntry {
    pub flags: SymbolFlags,
    pub address: u16,
    pub name: String,
    pub symbol_num: u8,
}

impl EsdEntry {
    pub fn is_entry(&self) -> bool {
        self.flags.contains(SymbolFlags::ENTRY)
    }

    pub fn is_external(&self) -> bool {
        self.flags.contains(SymbolFlags::EXTERNAL)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.name.len());
        bytes.push(self.flags.bits());
        bytes.push((self.address & 0xFF) as u8);
        bytes.push((self.address >> 8) as u8);
        bytes.push(self.name.len().min(255) as u8);
        bytes.extend(self.name.bytes().take(255));
        bytes
    }
}

/// A parsed (or to-be-written) REL module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelFile {
    pub code: Vec<u8>,
    pub rld: Vec<RldEntry>,
    pub esd: Vec<EsdEntry>,
}

impl RelFile {
    /// Serialize to the on-disk byte layout:
    /// `[len u16][code][RLD*][$00][ESD*][$00]`.
    pub fn build(&self) -> Vec<u8> {
        let code_len = self.code.len() as u16;
        let mut out = Vec::with_capacity(self.code.len() + 16);
        out.push((code_len & 0xFF) as u8);
        out.push((code_len >> 8) as u8);
        out.extend_from_slice(&self.code);

        for entry in &self.rld {
            // Absolute records would collide with the terminator.
            debug_assert_ne!(entry.flags, RldEntry::TYPE_ABSOLUTE);
            out.extend_from_slice(&entry.to_bytes());
        }
        out.push(0x00);

        for entry in &self.esd {
            out.extend_from_slice(&entry.to_bytes());
        }
        out.push(0x00);

        out
    }

    /// Parse a byte stream back into a module.
    pub fn parse(data: &[u8]) -> Result<RelFile, String> {
        if data.len() < 2 {
            return Err("REL file truncated: missing code length".to_string());
        }
        let code_len = data[0] as usize | ((data[1] as usize) << 8);
        if data.len() < 2 + code_len {
            return Err(format!(
                "REL file truncated: code length {} exceeds file size {}",
                code_len,
                data.len()
            ));
        }

        let mut rel = RelFile {
            code: data[2..2 + code_len].to_vec(),
            ..Default::default()
        };

        // RLD: 4-byte records until the $00 terminator.
        let mut pos = 2 + code_len;
        loop {
            match data.get(pos) {
                None => return Err("REL file truncated in RLD section".to_string()),
                Some(0x00) => {
                    pos += 1;
                    break;
                }
                Some(&flags) => {
                    if pos + 4 > data.len() {
                        return Err("REL file truncated in RLD record".to_string());
                    }
                    rel.rld.push(RldEntry {
                        flags,
                        address: data[pos + 1] as u16 | ((data[pos + 2] as u16) << 8),
                        symbol_num: data[pos + 3],
                    });
                    pos += 4;
                }
            }
        }

        // ESD: variable-length records until the $00 terminator.
        loop {
            match data.get(pos) {
                None => return Err("REL file truncated in ESD section".to_string()),
                Some(0x00) => break,
                Some(&flags) => {
                    if pos + 4 > data.len() {
                        return Err("REL file truncated in ESD record".to_string());
                    }
                    let name_len = data[pos + 3] as usize;
                    if pos + 4 + name_len > data.len() {
                        return Err("REL file truncated in ESD name".to_string());
                    }
                    let name = String::from_utf8_lossy(&data[pos + 4..pos + 4 + name_len])
                        .into_owned();
                    rel.esd.push(EsdEntry {
                        flags: SymbolFlags::from_bits_truncate(flags),
                        address: data[pos + 1] as u16 | ((data[pos + 2] as u16) << 8),
                        name,
                        symbol_num: 0,
                    });
                    pos += 4 + name_len;
                }
            }
        }

        // Externals are numbered in ESD order, matching the writer.
        let mut num = 0;
        for entry in &mut rel.esd {
            if entry.is_external() {
                entry.symbol_num = num;
                num += 1;
            }
        }

        Ok(rel)
    }
}
