//! Apple II soft-switch shims for the $C000-$C7FF I/O space and the
//! $0400-$07FF text page.
//!
//! Follows the trap-first discovery principle: anything not explicitly
//! modeled logs the access, snapshots the screen, dumps memory and
//! requests a stop so the missing switch can be added deliberately.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;

use log::{error, info};

use super::bus::{
    BankedMemory, Bus, LC_BANK1_OFFSET, LC_BANK2_OFFSET, LC_FIXED_RAM_OFFSET, MAIN_RAM_OFFSET,
    WRITE_SINK_OFFSET,
};
use super::traps::{write_memory_dump, SharedStatistics, TrapKind};

const KBD: u16 = 0xC000;
const KBDSTRB: u16 = 0xC010;
const TEXT_PAGE1: u16 = 0x0400;

pub type SharedHostShims = Rc<RefCell<HostShims>>;

/// Soft-switch state machine plus the queued-keyboard feed.
pub struct HostShims {
    input_lines: VecDeque<String>,
    current_line: Vec<u8>,
    current_pos: usize,

    kbd_data: u8,
    kbd_strobe: bool,

    text_mode: bool,
    mixed_mode: bool,
    page2: bool,
    hires: bool,

    screen_dirty: bool,
    stop_requested: bool,

    // Language card double-read state: which write-trigger address was
    // read last, and how many times in a row.
    lc_prev_trigger: Option<u16>,
    lc_consecutive_reads: u8,
    lc_write_enabled: bool,
    lc_nibble: u8,

    stats: SharedStatistics,
    dump_path: PathBuf,
}

impl HostShims {
    pub fn new(stats: SharedStatistics, dump_path: PathBuf) -> Self {
        Self {
            input_lines: VecDeque::new(),
            current_line: Vec::new(),
            current_pos: 0,
            kbd_data: 0,
            kbd_strobe: false,
            text_mode: true,
            mixed_mode: false,
            page2: false,
            hires: false,
            screen_dirty: false,
            stop_requested: false,
            lc_prev_trigger: None,
            lc_consecutive_reads: 0,
            lc_write_enabled: false,
            lc_nibble: 0,
            stats,
            dump_path,
        }
    }

    pub fn shared(stats: SharedStatistics, dump_path: PathBuf) -> SharedHostShims {
        Rc::new(RefCell::new(Self::new(stats, dump_path)))
    }

    /// Wire the I/O and text-page traps into the bus.
    pub fn install_io_traps(shims: &SharedHostShims, bus: &mut Bus) {
        let s = shims.clone();
        bus.set_read_trap_range(
            0xC000,
            0xC7FF,
            Box::new(move |mem, addr| Some(s.borrow_mut().io_read(mem, addr))),
            "IO",
        );

        let s = shims.clone();
        bus.set_write_trap_range(
            0xC000,
            0xC7FF,
            Box::new(move |mem, addr, value| {
                s.borrow_mut().io_write(mem, addr, value);
                true
            }),
            "IO",
        );

        let s = shims.clone();
        bus.set_write_trap_range(
            TEXT_PAGE1,
            0x07FF,
            Box::new(move |mem, addr, value| {
                s.borrow_mut().screen_write(mem, addr, value);
                false // the write still lands in memory
            }),
            "SCREEN",
        );
    }

    // ── Keyboard feed ─────────────────────────────────────────

    pub fn queue_input_line(&mut self, line: &str) {
        self.input_lines.push_back(line.to_string());
    }

    pub fn queue_input_lines<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            self.input_lines.push_back(line);
        }
    }

    pub fn has_queued_input(&self) -> bool {
        !self.input_lines.is_empty() || self.current_pos < self.current_line.len()
    }

    /// Next character from the feed; each queued line gets a trailing
    /// carriage return. Returns 0 when exhausted.
    fn next_char(&mut self) -> u8 {
        if self.current_pos >= self.current_line.len() {
            match self.input_lines.pop_front() {
                Some(line) => {
                    self.current_line = line.into_bytes();
                    self.current_line.push(b'\r');
                    self.current_pos = 0;
                }
                None => return 0,
            }
        }
        let ch = self.current_line[self.current_pos];
        self.current_pos += 1;
        ch
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested
    }

    // ── I/O dispatch ──────────────────────────────────────────

    fn io_read(&mut self, mem: &mut BankedMemory, addr: u16) -> u8 {
        match addr {
            0xC000..=0xC00F => self.kbd_read(mem),
            KBDSTRB => {
                self.kbd_strobe = false;
                0
            }
            0xC011..=0xC01F => 0,
            0xC030..=0xC03F => 0, // speaker toggle, no audio
            0xC050..=0xC05F => self.graphics_switch(addr),
            0xC060..=0xC06F => 0x00, // game buttons: not pressed
            0xC080..=0xC08F => self.language_card_access(mem, addr, false),
            _ => {
                self.unhandled_io(mem, addr, false, 0);
                0
            }
        }
    }

    fn io_write(&mut self, mem: &mut BankedMemory, addr: u16, value: u8) {
        match addr {
            KBDSTRB => self.kbd_strobe = false,
            0xC011..=0xC01F => {}
            0xC030..=0xC03F => {}
            0xC040..=0xC04F => {}
            0xC050..=0xC05F => {
                self.graphics_switch(addr);
            }
            0xC080..=0xC08F => {
                self.language_card_access(mem, addr, true);
            }
            _ => self.unhandled_io(mem, addr, true, value),
        }
    }

    // ── Keyboard ($C000 / $C010) ──────────────────────────────

    fn kbd_read(&mut self, mem: &mut BankedMemory) -> u8 {
        if self.screen_dirty {
            self.log_text_screen(mem);
            self.screen_dirty = false;
        }

        if self.kbd_strobe {
            return self.kbd_data | 0x80;
        }

        // Only latch a new key once the previous one has been fully
        // consumed.
        if self.kbd_data == 0 && self.has_queued_input() {
            let ch = self.next_char();
            if ch != 0 {
                self.kbd_data = ch & 0x7F;
                self.kbd_strobe = true;
                return self.kbd_data | 0x80;
            }
            return 0;
        }

        self.kbd_data
    }

    // ── Graphics soft switches ($C050-$C05F) ──────────────────

    fn graphics_switch(&mut self, addr: u16) -> u8 {
        match addr {
            0xC050 => self.text_mode = false,
            0xC051 => self.text_mode = true,
            0xC052 => self.mixed_mode = false,
            0xC053 => self.mixed_mode = true,
            0xC054 => self.page2 = false,
            0xC055 => self.page2 = true,
            0xC056 => self.hires = false,
            0xC057 => self.hires = true,
            _ => {} // $C058-$C05F annunciators: acknowledged
        }
        0
    }

    pub fn text_mode(&self) -> bool {
        self.text_mode
    }

    pub fn page2(&self) -> bool {
        self.page2
    }

    // ── Language card ($C080-$C08F) ───────────────────────────

    /// A write-enable trigger is any odd LC switch; enabling requires
    /// two consecutive reads of the same one.
    fn language_card_access(&mut self, mem: &mut BankedMemory, addr: u16, is_write: bool) -> u8 {
        let nibble = (addr & 0x0F) as u8;
        let is_trigger = nibble & 0x01 != 0;

        if !is_write && is_trigger {
            if self.lc_prev_trigger == Some(addr) {
                self.lc_consecutive_reads = self.lc_consecutive_reads.saturating_add(1);
            } else {
                self.lc_prev_trigger = Some(addr);
                self.lc_consecutive_reads = 1;
            }
            self.lc_write_enabled = self.lc_consecutive_reads >= 2;
            self.stats.borrow_mut().record_full(
                "LANG CARD",
                addr,
                TrapKind::DoubleRead,
                None,
                self.lc_write_enabled,
            );
        } else {
            // Anything that is not a read of the same trigger resets
            // the double-read sequence and drops write enable.
            self.lc_prev_trigger = None;
            self.lc_consecutive_reads = 0;
            self.lc_write_enabled = false;
            self.stats.borrow_mut().record(
                "LANG CARD",
                addr,
                if is_write { TrapKind::Write } else { TrapKind::Read },
            );
        }

        self.lc_nibble = nibble;
        self.apply_language_card(mem);
        0
    }

    /// Rewrite the six banks covering $D000-$FFFF from the current
    /// switch state.
    fn apply_language_card(&self, mem: &mut BankedMemory) {
        let nibble = self.lc_nibble;
        // Bit 3 clear selects the second 4 KiB bank, set the first.
        let bank_ram = if nibble & 0x08 != 0 {
            LC_BANK1_OFFSET
        } else {
            LC_BANK2_OFFSET
        };
        // Only the x1 family reads ROM; x0/x2/x3 read banked RAM.
        let read_rom = nibble & 0x03 == 0x01;

        // Banks 26-27: $D000-$DFFF, the switched 4 KiB region.
        for (i, bank) in (26..28).enumerate() {
            let offset = (i * 0x0800) as u32;
            let read = if read_rom {
                MAIN_RAM_OFFSET + 0xD000 + offset
            } else {
                bank_ram + offset
            };
            let write = if self.lc_write_enabled {
                bank_ram + offset
            } else {
                WRITE_SINK_OFFSET
            };
            mem.set_bank_mapping(bank, read, write);
        }

        // Banks 28-31: $E000-$FFFF, always the fixed 8 KiB region.
        for (i, bank) in (28..32).enumerate() {
            let offset = (i * 0x0800) as u32;
            let read = if read_rom {
                MAIN_RAM_OFFSET + 0xE000 + offset
            } else {
                LC_FIXED_RAM_OFFSET + offset
            };
            let write = if self.lc_write_enabled {
                LC_FIXED_RAM_OFFSET + offset
            } else {
                WRITE_SINK_OFFSET
            };
            mem.set_bank_mapping(bank, read, write);
        }
    }

    // ── Text screen ($0400-$07FF) ─────────────────────────────

    fn screen_write(&mut self, mem: &mut BankedMemory, addr: u16, value: u8) {
        self.screen_dirty = true;
        self.stats
            .borrow_mut()
            .record("SCREEN", addr, TrapKind::Write);

        // 'E' (any text mode, high bit masked) in the first screen
        // cell is the designated emulator-stop sentinel.
        if addr == TEXT_PAGE1 {
            let ch = value & 0x7F;
            if ch == b'E' || ch == b'e' {
                info!("first screen character set to 'E', stopping");
                self.log_text_screen(mem);
                if let Err(e) = write_memory_dump(mem, &self.dump_path) {
                    error!("cannot write memory dump: {e}");
                }
                self.stop_requested = true;
            }
        }
    }

    /// Render the 24×40 text page to stdout using the interlaced
    /// Apple II row layout.
    pub fn log_text_screen(&self, mem: &BankedMemory) {
        let base: u16 = if self.page2 { 0x0800 } else { 0x0400 };
        println!(
            "[screen] text page {} snapshot",
            if self.page2 { 2 } else { 1 }
        );
        for row in 0..24u16 {
            let row_base = base + (row % 8) * 128 + (row / 8) * 40;
            let mut line = format!("{row:2}: ");
            for col in 0..40u16 {
                let byte = mem.read(row_base + col);
                let ch = (byte & 0x7F) as char;
                line.push(if ('\x20'..='\x7e').contains(&ch) { ch } else { '.' });
            }
            println!("{line}");
        }
    }

    // ── Unimplemented I/O ─────────────────────────────────────

    fn unhandled_io(&mut self, mem: &mut BankedMemory, addr: u16, is_write: bool, value: u8) {
        self.stats.borrow_mut().record(
            "UNHANDLED IO",
            addr,
            if is_write { TrapKind::Write } else { TrapKind::Read },
        );
        error!(
            "unimplemented I/O {} at ${addr:04X} value=${value:02X}, stopping",
            if is_write { "WRITE" } else { "READ" }
        );
        self.log_text_screen(mem);
        if let Err(e) = write_memory_dump(mem, &self.dump_path) {
            error!("cannot write memory dump: {e}");
        }
        self.stop_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::traps::TrapStatistics;

    fn setup() -> (SharedHostShims, Bus) {
        let stats = TrapStatistics::shared();
        let shims = HostShims::shared(stats, PathBuf::from("/tmp/edasm_shim_test_dump.bin"));
        let mut bus = Bus::new();
        HostShims::install_io_traps(&shims, &mut bus);
        (shims, bus)
    }

    #[test]
    fn test_kbd_no_input() {
        let (_, mut bus) = setup();
        assert_eq!(bus.read(KBD), 0);
    }

    #[test]
    fn test_kbd_read_queued_line() {
        let (shims, mut bus) = setup();
        shims.borrow_mut().queue_input_line("A");

        // First read latches 'A' with the high bit set.
        assert_eq!(bus.read(KBD), b'A' | 0x80);
        // Strobe still set: same value, no consumption.
        assert_eq!(bus.read(KBD), b'A' | 0x80);
        // $C010 clears the strobe; the latch remains readable without
        // the high bit.
        bus.read(KBDSTRB);
        assert_eq!(bus.read(KBD), b'A');
    }

    #[test]
    fn test_kbdstrb_write_clears_strobe() {
        let (shims, mut bus) = setup();
        shims.borrow_mut().queue_input_line("Z");
        assert_eq!(bus.read(KBD) & 0x80, 0x80);
        bus.write(KBDSTRB, 0);
        assert_eq!(bus.read(KBD) & 0x80, 0);
    }

    #[test]
    fn test_queued_lines_get_carriage_returns() {
        let stats = TrapStatistics::shared();
        let mut shims = HostShims::new(stats, PathBuf::from("/tmp/x"));
        shims.queue_input_line("AB");
        assert_eq!(shims.next_char(), b'A');
        assert_eq!(shims.next_char(), b'B');
        assert_eq!(shims.next_char(), b'\r');
        assert_eq!(shims.next_char(), 0);
    }

    #[test]
    fn test_graphics_switches_toggle_on_read_and_write() {
        let (shims, mut bus) = setup();
        assert!(shims.borrow().text_mode());
        bus.read(0xC050);
        assert!(!shims.borrow().text_mode());
        bus.write(0xC051, 0);
        assert!(shims.borrow().text_mode());

        bus.read(0xC055);
        assert!(shims.borrow().page2());
        bus.read(0xC054);
        assert!(!shims.borrow().page2());
    }

    #[test]
    fn test_annunciators_and_speaker_are_quiet() {
        let (shims, mut bus) = setup();
        bus.read(0xC058);
        bus.read(0xC030);
        bus.write(0xC030, 0);
        assert!(!shims.borrow().should_stop());
    }

    #[test]
    fn test_unhandled_io_stops() {
        let (shims, mut bus) = setup();
        bus.read(0xC090);
        assert!(shims.borrow().should_stop());
    }

    #[test]
    fn test_screen_sentinel_stop() {
        let (shims, mut bus) = setup();
        bus.write(0x0401, b'X');
        assert!(!shims.borrow().should_stop());
        // 'E' with the high bit set (normal text) still triggers.
        bus.write(0x0400, b'E' | 0x80);
        assert!(shims.borrow().should_stop());
    }

    #[test]
    fn test_screen_write_passes_through_to_memory() {
        let (_, mut bus) = setup();
        bus.write(0x0450, 0xC1);
        assert_eq!(bus.mem.read(0x0450), 0xC1);
    }

    // ── Language card ─────────────────────────────────────────

    fn zero_rom(bus: &mut Bus) {
        // Simulate a loaded (all-zero) ROM image in $D000-$FFFF.
        bus.initialize_memory(0xD000, &[0u8; 0x3000]);
    }

    #[test]
    fn test_lc_single_read_does_not_write_enable() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        bus.read(0xC083);
        bus.write(0xD000, 0x55);
        // Write fell into the sink: RAM bank unmodified, still reads
        // the trap-opcode fill.
        assert_eq!(bus.read(0xD000), 0x02);
    }

    #[test]
    fn test_lc_double_read_enables_write() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        bus.read(0xC083);
        bus.read(0xC083);
        bus.write(0xD000, 0x55);
        assert_eq!(bus.read(0xD000), 0x55);

        // Fixed 8 KiB region follows the same enable.
        bus.write(0xE000, 0x11);
        assert_eq!(bus.read(0xE000), 0x11);
    }

    #[test]
    fn test_lc_read_only_bank_preserves_ram() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        bus.read(0xC083);
        bus.read(0xC083);
        bus.write(0xD000, 0x55);

        // $C080: read banked RAM, writes ignored.
        bus.read(0xC080);
        bus.write(0xD000, 0x66);
        assert_eq!(bus.read(0xD000), 0x55);
    }

    #[test]
    fn test_lc_rom_read_with_ram_write() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        // Prime banked RAM with a value.
        bus.read(0xC083);
        bus.read(0xC083);
        bus.write(0xD000, 0x77);

        // $C081 twice: reads come from ROM, writes go to banked RAM.
        bus.read(0xC081);
        bus.read(0xC081);
        bus.write(0xD000, 0x88);
        bus.write(0xE000, 0x99);
        assert_eq!(bus.read(0xD000), 0x00); // ROM image
        assert_eq!(bus.read(0xE000), 0x00);

        // Back to RAM reads: the writes through ROM mode landed in the
        // banked / fixed RAM.
        bus.read(0xC083);
        bus.read(0xC083);
        assert_eq!(bus.read(0xD000), 0x88);
        assert_eq!(bus.read(0xE000), 0x99);
    }

    #[test]
    fn test_lc_banks_are_distinct() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        // Bank 2 ($C083), write a marker.
        bus.read(0xC083);
        bus.read(0xC083);
        bus.write(0xD000, 0x22);

        // Bank 1 ($C08B), write a different marker.
        bus.read(0xC08B);
        bus.read(0xC08B);
        bus.write(0xD000, 0x11);

        // Each bank kept its own byte.
        bus.read(0xC080); // bank 2, read RAM
        assert_eq!(bus.read(0xD000), 0x22);
        bus.read(0xC088); // bank 1, read RAM
        assert_eq!(bus.read(0xD000), 0x11);
    }

    #[test]
    fn test_lc_write_access_resets_double_read() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        bus.read(0xC083);
        bus.write(0xC083, 0); // write access breaks the sequence
        bus.read(0xC083);
        bus.write(0xD000, 0x55);
        assert_eq!(bus.read(0xD000), 0x02); // still write-protected
    }

    #[test]
    fn test_lc_different_trigger_resets_count() {
        let (_, mut bus) = setup();
        zero_rom(&mut bus);

        bus.read(0xC083);
        bus.read(0xC081); // different trigger: sequence restarts
        bus.read(0xC083);
        bus.write(0xD000, 0x3C);
        assert_eq!(bus.read(0xD000), 0x02);
    }
}
