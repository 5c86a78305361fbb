// Persistent configuration: default load address, instruction cap,
// dump path, include nesting depth.
// Stored as JSON in <config_dir>/edasm/config.json

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Default load address for `run` when --load is absent.
    pub load_address: u16,
    /// Default instruction cap for `run` when --max is absent.
    pub max_instructions: u64,
    /// Where halt dumps land.
    pub dump_path: String,
    /// INCLUDE nesting bound for the assembler.
    pub include_depth_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            load_address: 0x2000,
            max_instructions: 1000,
            dump_path: "memory_dump.bin".to_string(),
            include_depth_limit: 16,
        }
    }
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("edasm"));
        }
    }
    env::var("HOME")
        .ok()
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".config").join("edasm"))
}

impl Config {
    /// Path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load config from disk, or return defaults if not found / invalid.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return Self::default(),
        };
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse_json(&content),
            Err(e) => {
                eprintln!("[edasm] Cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Save config to disk.
    pub fn save(&self) {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return,
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, self.to_json()) {
            eprintln!("[edasm] Cannot save config: {e}");
        }
    }

    /// Parse config from a JSON string. Unknown fields are ignored,
    /// missing fields get defaults. Manual parsing keeps the crate
    /// serde-free.
    fn parse_json(s: &str) -> Self {
        let mut config = Self::default();

        for line in s.lines() {
            let line = line.trim().trim_end_matches(',');
            if let Some(rest) = line.strip_prefix("\"load_address\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if let Some(n) = parse_u16_field(val) {
                    config.load_address = n;
                }
            } else if let Some(rest) = line.strip_prefix("\"max_instructions\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if let Ok(n) = val.parse::<u64>() {
                    config.max_instructions = n;
                }
            } else if let Some(rest) = line.strip_prefix("\"dump_path\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if let Some(s) = strip_json_string(val) {
                    config.dump_path = s;
                }
            } else if let Some(rest) = line.strip_prefix("\"include_depth_limit\"") {
                let val = rest.trim().trim_start_matches(':').trim();
                if let Ok(n) = val.parse::<u32>() {
                    config.include_depth_limit = n;
                }
            }
        }

        config
    }

    fn to_json(&self) -> String {
        format!(
            "{{\n  \"load_address\": {},\n  \"max_instructions\": {},\n  \"dump_path\": \"{}\",\n  \"include_depth_limit\": {}\n}}\n",
            self.load_address, self.max_instructions, self.dump_path, self.include_depth_limit
        )
    }
}

/// Accept both decimal and `"0x"`-prefixed hex for addresses.
fn parse_u16_field(val: &str) -> Option<u16> {
    if let Some(hex) = val.strip_prefix("\"0x").and_then(|v| v.strip_suffix('"')) {
        return u16::from_str_radix(hex, 16).ok();
    }
    val.parse::<u16>().ok()
}

fn strip_json_string(val: &str) -> Option<String> {
    let val = val.trim();
    if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
        Some(val[1..val.len() - 1].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.load_address, 0x2000);
        assert_eq!(c.include_depth_limit, 16);
    }

    #[test]
    fn test_parse_round_trip() {
        let c = Config {
            load_address: 0x0800,
            max_instructions: 500_000,
            dump_path: "dump.bin".to_string(),
            include_depth_limit: 8,
        };
        let parsed = Config::parse_json(&c.to_json());
        assert_eq!(parsed.load_address, 0x0800);
        assert_eq!(parsed.max_instructions, 500_000);
        assert_eq!(parsed.dump_path, "dump.bin");
        assert_eq!(parsed.include_depth_limit, 8);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let parsed = Config::parse_json("{\n  \"mystery\": true,\n  \"max_instructions\": 42\n}\n");
        assert_eq!(parsed.max_instructions, 42);
        assert_eq!(parsed.load_address, 0x2000);
    }

    #[test]
    fn test_hex_load_address() {
        let parsed = Config::parse_json("{\n  \"load_address\": \"0x2000\"\n}\n");
        assert_eq!(parsed.load_address, 0x2000);
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let parsed = Config::parse_json("not json at all");
        assert_eq!(parsed.max_instructions, Config::default().max_instructions);
    }
}
