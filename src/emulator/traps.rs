//! Trap dispatch and telemetry.
//!
//! The CPU funnels every $02 fetch into `TrapManager::handle`, which
//! looks up an address-specific handler or halts with diagnostics.
//! Every trap, handled or not, lands in the append-only statistics
//! table that is printed at shutdown.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{error, info};

use super::bus::{BankedMemory, Bus};
use super::cpu::{CpuState, Status, STACK_BASE};
use super::disassembly::SymbolRegistry;

/// Handler installed for one trap address. Returns false to halt.
pub type AddressHandler = Box<dyn FnMut(&mut CpuState, &mut Bus, u16) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Call,
    Read,
    Write,
    DoubleRead,
}

impl TrapKind {
    fn label(self) -> &'static str {
        match self {
            TrapKind::Call => "CALL",
            TrapKind::Read => "READ",
            TrapKind::Write => "WRITE",
            TrapKind::DoubleRead => "DBL_READ",
        }
    }
}

/// One row of the statistics table. Counts only ever grow.
#[derive(Debug, Clone)]
pub struct TrapStatistic {
    pub name: String,
    pub address: u16,
    pub kind: TrapKind,
    pub count: u64,
    pub mli_call: Option<String>,
    pub second_read: bool,
}

/// Append-only trap telemetry, shared by the trap manager, the host
/// shims and the MLI dispatcher.
#[derive(Default)]
pub struct TrapStatistics {
    records: Vec<TrapStatistic>,
}

pub type SharedStatistics = Rc<RefCell<TrapStatistics>>;

impl TrapStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStatistics {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn record(&mut self, name: &str, address: u16, kind: TrapKind) {
        self.record_full(name, address, kind, None, false);
    }

    pub fn record_mli(&mut self, address: u16, call_name: &str) {
        self.record_full("ProDOS MLI", address, TrapKind::Call, Some(call_name), false);
    }

    pub fn record_full(
        &mut self,
        name: &str,
        address: u16,
        kind: TrapKind,
        mli_call: Option<&str>,
        second_read: bool,
    ) {
        for stat in &mut self.records {
            if stat.address == address
                && stat.kind == kind
                && stat.name == name
                && stat.mli_call.as_deref() == mli_call
                && stat.second_read == second_read
            {
                stat.count += 1;
                return;
            }
        }
        self.records.push(TrapStatistic {
            name: name.to_string(),
            address,
            kind,
            count: 1,
            mli_call: mli_call.map(str::to_string),
            second_read,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Render the table sorted by address. Screen-write rows without a
    /// registered symbol are consolidated into a single row.
    pub fn render(&self, symbols: &SymbolRegistry) -> String {
        if self.records.is_empty() {
            return "\nNo trap statistics collected.\n".to_string();
        }

        let mut sorted: Vec<&TrapStatistic> = self.records.iter().collect();
        sorted.sort_by_key(|s| s.address);

        let mut out = String::new();
        let _ = writeln!(out, "\n=== TRAP STATISTICS ===");
        let _ = writeln!(
            out,
            "{:<6} {:<8} {:<20} {:<6} {:<20} Symbol",
            "Addr", "Kind", "Name", "Count", "Details"
        );
        let _ = writeln!(out, "{:-<90}", "");

        let consolidates = |s: &TrapStatistic| {
            s.name == "SCREEN" && s.kind == TrapKind::Write && symbols.lookup(s.address).is_none()
        };

        let screen_total: u64 = sorted
            .iter()
            .filter(|s| consolidates(s))
            .map(|s| s.count)
            .sum();
        if screen_total > 0 {
            let _ = writeln!(
                out,
                "{:<6} {:<8} {:<20} {:<6} {:<20}",
                "", "WRITE", "SCREEN", screen_total, "(consolidated)"
            );
        }

        for stat in &sorted {
            if consolidates(stat) {
                continue;
            }

            let mut details = String::new();
            if let Some(call) = &stat.mli_call {
                details.push_str("MLI:");
                details.push_str(call);
            }
            if stat.kind == TrapKind::DoubleRead {
                if !details.is_empty() {
                    details.push_str(", ");
                }
                details.push_str(if stat.second_read {
                    "2nd read"
                } else {
                    "1st read"
                });
            }

            let addr = format!("${:04X}", stat.address);
            let _ = write!(
                out,
                "{:<6} {:<8} {:<20} {:<6} {:<20}",
                addr,
                stat.kind.label(),
                stat.name,
                stat.count,
                details
            );
            if let Some(symbol) = symbols.lookup(stat.address) {
                let _ = write!(out, " <{symbol}>");
            }
            out.push('\n');
        }

        let _ = writeln!(out, "{:-<90}", "");
        let _ = writeln!(out, "Total trap entries: {}", self.records.len());
        let _ = writeln!(out, "=======================");
        out
    }
}

// ── Memory dump ───────────────────────────────────────────────

/// Write the 64 KiB CPU-visible address space (through the current
/// bank projection) for post-mortem inspection.
pub fn write_memory_dump(mem: &BankedMemory, path: &Path) -> io::Result<()> {
    let image = mem.dump_image();
    fs::write(path, &image)?;
    info!("memory dump written to {} ({} bytes)", path.display(), image.len());
    Ok(())
}

/// Hex view of a memory window, for halt diagnostics.
pub fn dump_memory_window(mem: &BankedMemory, addr: u16, len: u16) -> String {
    let mut out = format!("Memory at ${addr:04X}:\n");
    for i in 0..len {
        let a = addr.wrapping_add(i);
        if i % 16 == 0 {
            if i > 0 {
                out.push('\n');
            }
            let _ = write!(out, "  ${a:04X}: ");
        } else if i % 8 == 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X} ", mem.read(a));
    }
    out.push('\n');
    out
}

// ── Trap manager ──────────────────────────────────────────────

/// Registry of per-address trap handlers plus the shared statistics
/// collector and the dump destination.
pub struct TrapManager {
    handlers: BTreeMap<u16, (String, AddressHandler)>,
    stats: SharedStatistics,
    dump_path: PathBuf,
}

impl TrapManager {
    pub fn new(stats: SharedStatistics, dump_path: PathBuf) -> Self {
        Self {
            handlers: BTreeMap::new(),
            stats,
            dump_path,
        }
    }

    /// Register a handler for one trap address. The installer plants a
    /// $02 at that address (or relies on the power-on fill) so fetches
    /// reach it. An existing handler at the address is replaced.
    pub fn install_address_handler(&mut self, address: u16, handler: AddressHandler, name: &str) {
        self.handlers.insert(address, (name.to_string(), handler));
    }

    pub fn clear_address_handler(&mut self, address: u16) {
        self.handlers.remove(&address);
    }

    /// The single hook the CPU sees: dispatch to the installed handler
    /// for this address, or report and halt.
    pub fn handle(&mut self, cpu: &mut CpuState, bus: &mut Bus, trap_pc: u16) -> bool {
        if let Some((_, handler)) = self.handlers.get_mut(&trap_pc) {
            return handler(cpu, bus, trap_pc);
        }
        self.unhandled(cpu, bus, trap_pc)
    }

    fn unhandled(&mut self, cpu: &mut CpuState, bus: &mut Bus, trap_pc: u16) -> bool {
        self.stats
            .borrow_mut()
            .record("UNHANDLED", trap_pc, TrapKind::Call);

        error!("=== UNHANDLED TRAP at PC=${trap_pc:04X} ===");
        error!("CPU: {}", cpu.describe());
        error!("{}", dump_memory_window(&bus.mem, trap_pc, 32));
        error!("=== HALTING ===");

        if let Err(e) = write_memory_dump(&bus.mem, &self.dump_path) {
            error!("cannot write memory dump: {e}");
        }
        false
    }

    pub fn statistics(&self) -> SharedStatistics {
        self.stats.clone()
    }
}

/// Monitor SETNORM ($FE84) shim: set InvFlg ($32) to normal video,
/// load Y with $FF and return past the JSR frame.
pub fn monitor_setnorm_handler(stats: SharedStatistics) -> AddressHandler {
    Box::new(move |cpu: &mut CpuState, bus: &mut Bus, trap_pc: u16| {
        stats
            .borrow_mut()
            .record("MONITOR SETNORM", trap_pc, TrapKind::Call);

        bus.write(0x32, 0xFF);
        cpu.y = 0xFF;

        cpu.sp = cpu.sp.wrapping_add(1);
        let ret_lo = bus.read(STACK_BASE | cpu.sp as u16);
        cpu.sp = cpu.sp.wrapping_add(1);
        let ret_hi = bus.read(STACK_BASE | cpu.sp as u16);
        cpu.pc = (((ret_hi as u16) << 8) | ret_lo as u16).wrapping_add(1);

        cpu.p.insert(Status::U);
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::cpu::Cpu;

    fn manager() -> TrapManager {
        TrapManager::new(TrapStatistics::shared(), PathBuf::from("/tmp/edasm_test_dump.bin"))
    }

    #[test]
    fn test_statistics_grouping() {
        let stats = TrapStatistics::shared();
        stats.borrow_mut().record("KBD", 0xC000, TrapKind::Read);
        stats.borrow_mut().record("KBD", 0xC000, TrapKind::Read);
        stats.borrow_mut().record("KBD", 0xC000, TrapKind::Write);
        let s = stats.borrow();
        assert_eq!(s.len(), 2);
        assert_eq!(s.records[0].count, 2);
    }

    #[test]
    fn test_statistics_mli_keying() {
        let stats = TrapStatistics::shared();
        stats.borrow_mut().record_mli(0xBF00, "OPEN");
        stats.borrow_mut().record_mli(0xBF00, "READ");
        stats.borrow_mut().record_mli(0xBF00, "OPEN");
        let s = stats.borrow();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_render_sorted_and_consolidated() {
        let stats = TrapStatistics::shared();
        stats.borrow_mut().record("SCREEN", 0x0450, TrapKind::Write);
        stats.borrow_mut().record("SCREEN", 0x0451, TrapKind::Write);
        stats.borrow_mut().record("KBD", 0xC000, TrapKind::Read);
        let symbols = SymbolRegistry::with_defaults();
        let rendered = stats.borrow().render(&symbols);
        assert!(rendered.contains("(consolidated)"));
        assert!(rendered.contains("$C000"));
        assert!(rendered.contains("<KBD>"));
        // Individual unnamed screen rows are folded away.
        assert!(!rendered.contains("$0450"));
    }

    #[test]
    fn test_installed_handler_dispatch() {
        let mut tm = manager();
        tm.install_address_handler(
            0xBF00,
            Box::new(|cpu, _, _| {
                cpu.a = 0x77;
                true
            }),
            "test",
        );

        let mut bus = Bus::new();
        let mut cpu = Cpu::new();
        cpu.state.pc = 0xBF00;
        assert!(tm.handle(&mut cpu.state, &mut bus, 0xBF00));
        assert_eq!(cpu.state.a, 0x77);
    }

    #[test]
    fn test_cleared_handler_falls_back_to_unhandled() {
        let mut tm = manager();
        tm.install_address_handler(0x9000, Box::new(|_, _, _| true), "temp");
        tm.clear_address_handler(0x9000);

        let mut bus = Bus::new();
        let mut cpu = Cpu::new();
        assert!(!tm.handle(&mut cpu.state, &mut bus, 0x9000));
    }

    #[test]
    fn test_unhandled_trap_halts_and_records() {
        let mut tm = manager();
        let mut bus = Bus::new();
        let mut cpu = Cpu::new();
        assert!(!tm.handle(&mut cpu.state, &mut bus, 0x1234));
        let stats = tm.statistics();
        let s = stats.borrow();
        assert_eq!(s.len(), 1);
        assert_eq!(s.records[0].name, "UNHANDLED");
        assert_eq!(s.records[0].address, 0x1234);
    }

    #[test]
    fn test_setnorm_shim() {
        let stats = TrapStatistics::shared();
        let mut handler = monitor_setnorm_handler(stats);

        let mut bus = Bus::new();
        let mut cpu = Cpu::new();
        // Simulate JSR $FE84 from $2000: return address - 1 = $2002.
        bus.write(0x01FF, 0x20);
        bus.write(0x01FE, 0x02);
        cpu.state.sp = 0xFD;

        assert!(handler(&mut cpu.state, &mut bus, 0xFE84));
        assert_eq!(bus.read(0x32), 0xFF);
        assert_eq!(cpu.state.y, 0xFF);
        assert_eq!(cpu.state.sp, 0xFF);
        assert_eq!(cpu.state.pc, 0x2003);
    }

    #[test]
    fn test_memory_window_format() {
        let mut bus = Bus::new();
        bus.write(0x3000, 0xAB);
        let s = dump_memory_window(&bus.mem, 0x3000, 16);
        assert!(s.contains("$3000"));
        assert!(s.contains("AB"));
    }
}
