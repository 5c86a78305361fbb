//! 65C02 emulator core: bus, CPU, trap layer, Apple II host shims and
//! the ProDOS MLI, wired together by [`Machine`].

pub mod bus;
pub mod cpu;
pub mod disassembly;
pub mod host_shims;
pub mod mli;
pub mod traps;

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use log::info;

use bus::Bus;
use cpu::Cpu;
use disassembly::{Disassembler, SymbolRegistry};
use host_shims::{HostShims, SharedHostShims};
use mli::{Mli, SharedMli, MLI_ENTRY};
use traps::{monitor_setnorm_handler, SharedStatistics, TrapManager, TrapStatistics};

/// Monitor soft-entry vector ($03F2) and power-up byte ($03F4).
const SOFTEV: u16 = 0x03F2;
const PWREDUP: u16 = 0x03F4;

const SETNORM: u16 = 0xFE84;
const ROM_BASE: u16 = 0xF800;
const DEFAULT_LOAD_ADDRESS: u16 = 0x2000;

#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub binary: Option<PathBuf>,
    pub load_address: u16,
    /// Entry override; the reset vector is honored otherwise.
    pub entry: Option<u16>,
    /// Monitor ROM image, loaded bank-bypassed at $F800.
    pub rom: Option<PathBuf>,
    pub input_lines: Vec<String>,
    pub max_instructions: u64,
    pub trace: bool,
    pub dump_path: PathBuf,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            binary: None,
            load_address: DEFAULT_LOAD_ADDRESS,
            entry: None,
            rom: None,
            input_lines: Vec::new(),
            max_instructions: 1000,
            trace: false,
            dump_path: PathBuf::from("memory_dump.bin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A trap handler or the stop sentinel ended execution.
    Halted,
    /// The instruction cap was reached while still running.
    InstructionCapReached,
}

/// The assembled emulator: every component constructed and wired in
/// the startup order the system expects.
pub struct Machine {
    pub bus: Bus,
    pub cpu: Cpu,
    pub shims: SharedHostShims,
    pub traps: Rc<RefCell<TrapManager>>,
    pub mli: SharedMli,
    pub stats: SharedStatistics,
    pub symbols: SymbolRegistry,
    disasm: Disassembler,
    trace: bool,
    max_instructions: u64,
}

impl Machine {
    pub fn new(options: MachineOptions) -> Result<Self, String> {
        let stats = TrapStatistics::shared();
        let mut bus = Bus::new();

        // Monitor soft-entry vectors: SOFTEV -> $2000, PWREDUP valid.
        bus.write(SOFTEV, 0x00);
        bus.write(SOFTEV + 1, 0x20);
        bus.write(PWREDUP, 0x20 ^ 0xA5);

        // ROM loads bank-bypassed; the power-on map write-protects it.
        if let Some(rom_path) = &options.rom {
            let rom = fs::read(rom_path)
                .map_err(|e| format!("cannot read ROM {}: {e}", rom_path.display()))?;
            if !bus.initialize_memory(ROM_BASE, &rom) {
                return Err(format!(
                    "ROM image too large: {} bytes at ${ROM_BASE:04X}",
                    rom.len()
                ));
            }
            info!("monitor ROM mapped at ${ROM_BASE:04X} ({} bytes)", rom.len());
        }

        // MLI and monitor traps go in before the I/O shims, then the
        // program loads through the banked write path.
        let mli = Mli::shared(stats.clone(), options.dump_path.clone());
        let mut manager = TrapManager::new(stats.clone(), options.dump_path.clone());
        manager.install_address_handler(MLI_ENTRY, Mli::trap_handler(&mli), "ProDOS MLI");
        manager.install_address_handler(
            SETNORM,
            monitor_setnorm_handler(stats.clone()),
            "MONITOR SETNORM",
        );
        let traps = Rc::new(RefCell::new(manager));

        let shims = HostShims::shared(stats.clone(), options.dump_path.clone());
        HostShims::install_io_traps(&shims, &mut bus);
        shims
            .borrow_mut()
            .queue_input_lines(options.input_lines.clone());

        if let Some(binary_path) = &options.binary {
            let program = fs::read(binary_path)
                .map_err(|e| format!("cannot read binary {}: {e}", binary_path.display()))?;
            if !bus.write_binary_data(options.load_address, &program) {
                return Err(format!(
                    "binary does not fit: {} bytes at ${:04X}",
                    program.len(),
                    options.load_address
                ));
            }
            info!(
                "loaded {} ({} bytes) at ${:04X}",
                binary_path.display(),
                program.len(),
                options.load_address
            );
        }

        let mut cpu = Cpu::new();
        let tm = traps.clone();
        cpu.set_trap_handler(Box::new(move |state, bus, pc| {
            tm.borrow_mut().handle(state, bus, pc)
        }));

        cpu.reset(&mut bus);
        if let Some(entry) = options.entry {
            cpu.state.pc = entry;
        }
        info!("entry point ${:04X}", cpu.state.pc);

        Ok(Self {
            bus,
            cpu,
            shims,
            traps,
            mli,
            stats,
            symbols: SymbolRegistry::with_defaults(),
            disasm: Disassembler::new(),
            trace: options.trace,
            max_instructions: options.max_instructions,
        })
    }

    /// Drive the CPU until a halt, the stop sentinel, or the
    /// instruction cap.
    pub fn run(&mut self) -> RunOutcome {
        let mut count: u64 = 0;

        while count < self.max_instructions {
            if self.trace {
                println!(
                    "[{count}] {}    {}",
                    self.cpu.state.describe(),
                    self.disasm.format_instruction(&self.bus.mem, self.cpu.state.pc)
                );
            }

            let running = self.cpu.step(&mut self.bus);
            count += 1;

            if !running {
                info!("halted by trap handler after {count} instructions");
                self.shutdown();
                return RunOutcome::Halted;
            }
            if self.shims.borrow().should_stop() {
                info!("halted by host shims after {count} instructions");
                self.shutdown();
                return RunOutcome::Halted;
            }
        }

        info!("instruction cap ({}) reached", self.max_instructions);
        self.shutdown();
        RunOutcome::InstructionCapReached
    }

    fn shutdown(&mut self) {
        self.mli.borrow_mut().close_all();
        println!("Final CPU state: {}", self.cpu.state.describe());
        print!("{}", self.stats.borrow().render(&self.symbols));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with_program(program: &[u8], at: u16, max: u64) -> Machine {
        let mut m = Machine::new(MachineOptions {
            max_instructions: max,
            dump_path: std::env::temp_dir().join("edasm_machine_test_dump.bin"),
            ..Default::default()
        })
        .unwrap();
        m.bus.write_binary_data(at, program);
        m.cpu.state.pc = at;
        m
    }

    #[test]
    fn test_instruction_cap_reached() {
        // JMP * spins forever.
        let mut m = machine_with_program(&[0x4C, 0x00, 0x20], 0x2000, 25);
        assert_eq!(m.run(), RunOutcome::InstructionCapReached);
    }

    #[test]
    fn test_sentinel_write_stops_run() {
        // LDA #'E' (normal text, high bit set), STA $0400, JMP *.
        let mut m = machine_with_program(&[0xA9, 0xC5, 0x8D, 0x00, 0x04, 0x4C, 0x05, 0x20], 0x2000, 100);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert!(m.shims.borrow().should_stop());
    }

    #[test]
    fn test_unhandled_trap_halts_run() {
        // A bare $02 with no handler registered at that address.
        let mut m = machine_with_program(&[0x02], 0x2000, 100);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert!(!m.stats.borrow().is_empty());
    }

    #[test]
    fn test_reset_vector_honored() {
        let mut m = Machine::new(MachineOptions::default()).unwrap();
        m.bus.initialize_memory(0xFFFC, &[0x34, 0x12]);
        m.cpu.reset(&mut m.bus);
        assert_eq!(m.cpu.state.pc, 0x1234);
    }

    #[test]
    fn test_entry_override() {
        let m = Machine::new(MachineOptions {
            entry: Some(0x4000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(m.cpu.state.pc, 0x4000);
    }

    #[test]
    fn test_assembled_program_runs_on_the_machine() {
        use crate::asm::assembler::{Assembler, Options};

        let source = "\tORG $2000\n\
                      START\tLDA #$C5\n\
                      \tSTA $20\n\
                      \tSTA $0400\n\
                      \tJMP START\n\
                      \tEND\n";
        let mut assembler = Assembler::new();
        let r = assembler.assemble(source, Options::default());
        assert!(r.success, "assembly failed: {:?}", r.errors);
        assert_eq!(
            r.code,
            vec![0xA9, 0xC5, 0x85, 0x20, 0x8D, 0x00, 0x04, 0x4C, 0x00, 0x20]
        );

        // 'E' (normal text) in the first screen cell stops the run.
        let mut m = machine_with_program(&r.code, 0x2000, 100);
        assert_eq!(m.run(), RunOutcome::Halted);
        assert_eq!(m.bus.mem.read(0x20), 0xC5);
        assert_eq!(m.bus.mem.read(0x0400), 0xC5);
    }

    #[test]
    fn test_mli_reachable_through_cpu() {
        // JSR $BF00 with inline QUIT ($65) call: the stub returns
        // BAD_CALL_NUMBER in A and execution continues to the RTS...
        // which underflows into a trap halt, proving resumption.
        let mut m = machine_with_program(
            &[
                0x20, 0x00, 0xBF, // JSR $BF00
                0x65, 0x10, 0x20, // inline: call $65, params at $2010
                0xA9, 0x00, // LDA #$00 (resumes here)
                0x02, // explicit trap -> halt
            ],
            0x2000,
            100,
        );
        m.bus.write(0x2010, 4);
        assert_eq!(m.run(), RunOutcome::Halted);
        // A holds the BAD_CALL_NUMBER error until LDA clears it; the
        // final LDA #$00 proves the guest resumed past the frame. The
        // PC sits one past the trap byte that halted us.
        assert_eq!(m.cpu.state.a, 0x00);
        assert_eq!(m.cpu.state.pc, 0x2009);
    }
}
