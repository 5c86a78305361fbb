//! ProDOS MLI (Machine Language Interface) shim.
//!
//! The system binary calls ProDOS with `JSR $BF00` followed by three
//! inline bytes: the call number and a pointer to a parameter list.
//! A trap planted at $BF00 decodes the frame, marshals parameters
//! through a descriptor table, services the call against the host
//! filesystem and resumes the guest past the inline bytes.
//!
//! Failed-but-legal calls return their ProDOS error byte in A with
//! carry set and execution continues; only an unknown call number
//! halts the emulator.

use std::cell::RefCell;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;

use chrono::{Datelike, Local, Timelike};
use log::{debug, error, warn};

use crate::files::type_from_extension;

use super::bus::Bus;
use super::cpu::{CpuState, Status, STACK_BASE};
use super::traps::{write_memory_dump, AddressHandler, SharedStatistics};

/// MLI entry point in the ProDOS global page.
pub const MLI_ENTRY: u16 = 0xBF00;
/// ProDOS system date/time cells ($BF90-$BF93).
pub const P8DATE: u16 = 0xBF90;
pub const P8TIME: u16 = 0xBF92;

const MAX_PATHNAME: usize = 64;
const MAX_FILES: usize = 16; // refnums 1-15; slot 0 reserved

// ── Error codes ───────────────────────────────────────────────

/// ProDOS 8 error bytes (Technical Reference Manual §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProdosError {
    NoError,
    BadCallNumber,
    BadParamCount,
    InterruptTableFull,
    IoError,
    NoDevice,
    WriteProtected,
    DiskSwitched,
    InvalidPathSyntax,
    FcbFull,
    InvalidRefNum,
    PathNotFound,
    VolNotFound,
    FileNotFound,
    DuplicateFile,
    DiskFull,
    VolDirFull,
    IncompatibleFormat,
    UnsupportedStorage,
    EndOfFile,
    PositionOutOfRange,
    AccessError,
    FileOpen,
    DirCountError,
    NotProdosDisk,
    InvalidParameter,
    VcbFull,
    BadBufferAddr,
    DuplicateVolume,
    BitmapImpossible,
}

impl ProdosError {
    pub fn code(self) -> u8 {
        use ProdosError::*;
        match self {
            NoError => 0x00,
            BadCallNumber => 0x01,
            BadParamCount => 0x04,
            InterruptTableFull => 0x25,
            IoError => 0x27,
            NoDevice => 0x28,
            WriteProtected => 0x2B,
            DiskSwitched => 0x2E,
            InvalidPathSyntax => 0x40,
            FcbFull => 0x42,
            InvalidRefNum => 0x43,
            PathNotFound => 0x44,
            VolNotFound => 0x45,
            FileNotFound => 0x46,
            DuplicateFile => 0x47,
            DiskFull => 0x48,
            VolDirFull => 0x49,
            IncompatibleFormat => 0x4A,
            UnsupportedStorage => 0x4B,
            EndOfFile => 0x4C,
            PositionOutOfRange => 0x4D,
            AccessError => 0x4E,
            FileOpen => 0x50,
            DirCountError => 0x51,
            NotProdosDisk => 0x52,
            InvalidParameter => 0x53,
            VcbFull => 0x55,
            BadBufferAddr => 0x56,
            DuplicateVolume => 0x57,
            BitmapImpossible => 0x5A,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use ProdosError::*;
        Some(match code {
            0x00 => NoError,
            0x01 => BadCallNumber,
            0x04 => BadParamCount,
            0x25 => InterruptTableFull,
            0x27 => IoError,
            0x28 => NoDevice,
            0x2B => WriteProtected,
            0x2E => DiskSwitched,
            0x40 => InvalidPathSyntax,
            0x42 => FcbFull,
            0x43 => InvalidRefNum,
            0x44 => PathNotFound,
            0x45 => VolNotFound,
            0x46 => FileNotFound,
            0x47 => DuplicateFile,
            0x48 => DiskFull,
            0x49 => VolDirFull,
            0x4A => IncompatibleFormat,
            0x4B => UnsupportedStorage,
            0x4C => EndOfFile,
            0x4D => PositionOutOfRange,
            0x4E => AccessError,
            0x50 => FileOpen,
            0x51 => DirCountError,
            0x52 => NotProdosDisk,
            0x53 => InvalidParameter,
            0x55 => VcbFull,
            0x56 => BadBufferAddr,
            0x57 => DuplicateVolume,
            0x5A => BitmapImpossible,
            _ => return None,
        })
    }

    pub fn message(self) -> &'static str {
        use ProdosError::*;
        match self {
            NoError => "Success",
            BadCallNumber => "Bad system call number",
            BadParamCount => "Bad system call parameter count",
            InterruptTableFull => "Interrupt vector table full",
            IoError => "I/O error",
            NoDevice => "No device detected",
            WriteProtected => "Disk write protected",
            DiskSwitched => "Disk switched",
            InvalidPathSyntax => "Invalid pathname syntax",
            FcbFull => "File Control Block table full",
            InvalidRefNum => "Invalid reference number",
            PathNotFound => "Path not found",
            VolNotFound => "Volume directory not found",
            FileNotFound => "File not found",
            DuplicateFile => "Duplicate filename",
            DiskFull => "Disk full",
            VolDirFull => "Volume directory full",
            IncompatibleFormat => "Incompatible file format",
            UnsupportedStorage => "Unsupported storage type",
            EndOfFile => "End of file encountered",
            PositionOutOfRange => "Position out of range",
            AccessError => "Access error",
            FileOpen => "File is open",
            DirCountError => "Directory count error",
            NotProdosDisk => "Not a ProDOS disk",
            InvalidParameter => "Invalid parameter",
            VcbFull => "Volume Control Block table full",
            BadBufferAddr => "Bad buffer address",
            DuplicateVolume => "Duplicate volume",
            BitmapImpossible => "Bit map disk address is impossible",
        }
    }
}

// ── Descriptors ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Byte,
    Word,
    ThreeByte,
    PathnamePtr,
    BufferPtr,
    RefNum,
}

impl ParamType {
    fn size(self) -> u16 {
        match self {
            ParamType::Byte | ParamType::RefNum => 1,
            ParamType::Word | ParamType::PathnamePtr | ParamType::BufferPtr => 2,
            ParamType::ThreeByte => 3,
        }
    }

    fn is_pointer(self) -> bool {
        matches!(self, ParamType::PathnamePtr | ParamType::BufferPtr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamDescriptor {
    pub ptype: ParamType,
    pub direction: ParamDirection,
    pub name: &'static str,
}

const fn p(ptype: ParamType, direction: ParamDirection, name: &'static str) -> ParamDescriptor {
    ParamDescriptor {
        ptype,
        direction,
        name,
    }
}

/// Marshalled parameter value: the tagged sum the descriptor table
/// encodes and decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Byte(u8),
    Word(u16),
    ThreeByte(u32),
    Pathname(String),
    Pointer(u16),
}

impl ParamValue {
    fn as_byte(&self) -> u8 {
        match self {
            ParamValue::Byte(v) => *v,
            _ => 0,
        }
    }

    fn as_word(&self) -> u16 {
        match self {
            ParamValue::Word(v) => *v,
            ParamValue::Pointer(v) => *v,
            _ => 0,
        }
    }

    fn as_three_byte(&self) -> u32 {
        match self {
            ParamValue::ThreeByte(v) => *v,
            _ => 0,
        }
    }

    fn as_pathname(&self) -> &str {
        match self {
            ParamValue::Pathname(s) => s,
            _ => "",
        }
    }
}

type HandlerFn = fn(&mut Mli, &mut Bus, &[ParamValue], &mut Vec<ParamValue>) -> ProdosError;

pub struct CallDescriptor {
    pub call_number: u8,
    pub name: &'static str,
    pub params: &'static [ParamDescriptor],
    handler: Option<HandlerFn>,
}

use ParamDirection::{In, InOut, Out};
use ParamType::{BufferPtr, Byte, PathnamePtr, RefNum, ThreeByte, Word};

/// Every call number the dispatcher recognizes. Calls without a
/// handler are acknowledged with BAD_CALL_NUMBER; anything absent from
/// this table halts the emulator.
static CALL_DESCRIPTORS: &[CallDescriptor] = &[
    CallDescriptor {
        call_number: 0x40,
        name: "ALLOC_INTERRUPT",
        params: &[p(Byte, In, "int_num"), p(Word, In, "int_code")],
        handler: None,
    },
    CallDescriptor {
        call_number: 0x41,
        name: "DEALLOC_INTERRUPT",
        params: &[p(Byte, In, "int_num")],
        handler: None,
    },
    CallDescriptor {
        call_number: 0x65,
        name: "QUIT",
        params: &[
            p(Byte, In, "quit_type"),
            p(Word, In, "reserved1"),
            p(Byte, In, "reserved2"),
            p(Word, In, "reserved3"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0x80,
        name: "READ_BLOCK",
        params: &[
            p(Byte, In, "unit_num"),
            p(BufferPtr, In, "data_buffer"),
            p(Word, In, "block_num"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0x81,
        name: "WRITE_BLOCK",
        params: &[
            p(Byte, In, "unit_num"),
            p(BufferPtr, In, "data_buffer"),
            p(Word, In, "block_num"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0x82,
        name: "GET_TIME",
        params: &[],
        handler: Some(Mli::handle_get_time),
    },
    CallDescriptor {
        call_number: 0xC0,
        name: "CREATE",
        params: &[
            p(PathnamePtr, In, "pathname"),
            p(Byte, In, "access"),
            p(Byte, In, "file_type"),
            p(Word, In, "aux_type"),
            p(Byte, In, "storage_type"),
            p(Word, In, "create_date"),
            p(Word, In, "create_time"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xC1,
        name: "DESTROY",
        params: &[p(PathnamePtr, In, "pathname")],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xC2,
        name: "RENAME",
        params: &[
            p(PathnamePtr, In, "pathname"),
            p(PathnamePtr, In, "new_pathname"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xC3,
        name: "SET_FILE_INFO",
        params: &[
            p(PathnamePtr, In, "pathname"),
            p(Byte, In, "access"),
            p(Byte, In, "file_type"),
            p(Word, In, "aux_type"),
            p(Byte, In, "reserved1"),
            p(Word, In, "mod_date"),
            p(Word, In, "mod_time"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xC4,
        name: "GET_FILE_INFO",
        params: &[
            p(PathnamePtr, In, "pathname"),
            p(Byte, Out, "access"),
            p(Byte, Out, "file_type"),
            p(Word, Out, "aux_type"),
            p(Byte, Out, "storage_type"),
            p(Word, Out, "blocks_used"),
            p(Word, Out, "mod_date"),
            p(Word, Out, "mod_time"),
            p(Word, Out, "create_date"),
            p(Word, Out, "create_time"),
            p(ThreeByte, Out, "eof"),
        ],
        handler: Some(Mli::handle_get_file_info),
    },
    CallDescriptor {
        call_number: 0xC5,
        name: "ONLINE",
        params: &[
            p(Byte, In, "unit_num"),
            p(BufferPtr, InOut, "data_buffer"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xC6,
        name: "SET_PREFIX",
        params: &[p(PathnamePtr, In, "pathname")],
        handler: Some(Mli::handle_set_prefix),
    },
    CallDescriptor {
        call_number: 0xC7,
        name: "GET_PREFIX",
        params: &[p(BufferPtr, Out, "data_buffer")],
        handler: Some(Mli::handle_get_prefix),
    },
    CallDescriptor {
        call_number: 0xC8,
        name: "OPEN",
        params: &[
            p(PathnamePtr, In, "pathname"),
            p(BufferPtr, In, "io_buffer"),
            p(RefNum, Out, "ref_num"),
        ],
        handler: Some(Mli::handle_open),
    },
    CallDescriptor {
        call_number: 0xC9,
        name: "NEWLINE",
        params: &[
            p(RefNum, In, "ref_num"),
            p(Byte, In, "enable_mask"),
            p(Byte, In, "newline_char"),
        ],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xCA,
        name: "READ",
        params: &[
            p(RefNum, In, "ref_num"),
            p(BufferPtr, InOut, "data_buffer"),
            p(Word, In, "request_count"),
            p(Word, Out, "transfer_count"),
        ],
        handler: Some(Mli::handle_read),
    },
    CallDescriptor {
        call_number: 0xCB,
        name: "WRITE",
        params: &[
            p(RefNum, In, "ref_num"),
            p(BufferPtr, In, "data_buffer"),
            p(Word, In, "request_count"),
            p(Word, Out, "transfer_count"),
        ],
        handler: Some(Mli::handle_write),
    },
    CallDescriptor {
        call_number: 0xCC,
        name: "CLOSE",
        params: &[p(RefNum, In, "ref_num")],
        handler: Some(Mli::handle_close),
    },
    CallDescriptor {
        call_number: 0xCD,
        name: "FLUSH",
        params: &[p(RefNum, In, "ref_num")],
        handler: Some(Mli::handle_flush),
    },
    CallDescriptor {
        call_number: 0xCE,
        name: "SET_MARK",
        params: &[p(RefNum, In, "ref_num"), p(ThreeByte, In, "position")],
        handler: Some(Mli::handle_set_mark),
    },
    CallDescriptor {
        call_number: 0xCF,
        name: "GET_MARK",
        params: &[p(RefNum, In, "ref_num"), p(ThreeByte, Out, "position")],
        handler: Some(Mli::handle_get_mark),
    },
    CallDescriptor {
        call_number: 0xD0,
        name: "SET_EOF",
        params: &[p(RefNum, In, "ref_num"), p(ThreeByte, In, "eof")],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xD1,
        name: "GET_EOF",
        params: &[p(RefNum, In, "ref_num"), p(ThreeByte, Out, "eof")],
        handler: Some(Mli::handle_get_eof),
    },
    CallDescriptor {
        call_number: 0xD2,
        name: "SET_BUF",
        params: &[p(RefNum, In, "ref_num"), p(BufferPtr, In, "io_buffer")],
        handler: None,
    },
    CallDescriptor {
        call_number: 0xD3,
        name: "GET_BUF",
        params: &[p(RefNum, In, "ref_num"), p(BufferPtr, Out, "io_buffer")],
        handler: None,
    },
];

pub fn call_descriptor(call_number: u8) -> Option<&'static CallDescriptor> {
    CALL_DESCRIPTORS
        .iter()
        .find(|d| d.call_number == call_number)
}

// ── Open-file table ───────────────────────────────────────────

pub struct OpenFile {
    pub file: File,
    pub host_path: PathBuf,
    pub mark: u32,
    pub length: u32,
    /// NEWLINE mode bytes; retained in the slot even though the
    /// NEWLINE call itself is a stub.
    pub newline_mask: u8,
    pub newline_char: u8,
}

// ── MLI context ───────────────────────────────────────────────

/// Open-file table plus dispatch state. Owned by the machine and
/// shared with the trap handler via `Rc<RefCell>`.
pub struct Mli {
    files: [Option<OpenFile>; MAX_FILES],
    stats: SharedStatistics,
    dump_path: PathBuf,
}

pub type SharedMli = Rc<RefCell<Mli>>;

impl Mli {
    pub fn new(stats: SharedStatistics, dump_path: PathBuf) -> Self {
        Self {
            files: std::array::from_fn(|_| None),
            stats,
            dump_path,
        }
    }

    pub fn shared(stats: SharedStatistics, dump_path: PathBuf) -> SharedMli {
        Rc::new(RefCell::new(Self::new(stats, dump_path)))
    }

    /// Build the trap handler to install at $BF00.
    pub fn trap_handler(mli: &SharedMli) -> AddressHandler {
        let mli = mli.clone();
        Box::new(move |cpu, bus, trap_pc| mli.borrow_mut().dispatch(cpu, bus, trap_pc))
    }

    pub fn open_file_count(&self) -> usize {
        self.files.iter().flatten().count()
    }

    pub fn close_all(&mut self) {
        for slot in self.files.iter_mut() {
            *slot = None;
        }
    }

    // ── Dispatch ──────────────────────────────────────────────

    fn dispatch(&mut self, cpu: &mut CpuState, bus: &mut Bus, trap_pc: u16) -> bool {
        // JSR left the address of its own last byte on the stack; the
        // three inline argument bytes follow it.
        let ret_lo = bus.mem.read(STACK_BASE | cpu.sp.wrapping_add(1) as u16);
        let ret_hi = bus.mem.read(STACK_BASE | cpu.sp.wrapping_add(2) as u16);
        let ret_addr = ((ret_hi as u16) << 8) | ret_lo as u16;
        let call_site = ret_addr.wrapping_add(1);

        let call_num = bus.mem.read(call_site);
        let param_list = bus.mem.read(call_site.wrapping_add(1)) as u16
            | ((bus.mem.read(call_site.wrapping_add(2)) as u16) << 8);

        let desc = match call_descriptor(call_num) {
            Some(d) => d,
            None => {
                self.stats.borrow_mut().record_mli(trap_pc, "UNKNOWN");
                error!(
                    "unknown ProDOS MLI call ${call_num:02X} at PC=${trap_pc:04X}, halting"
                );
                error!("CPU: {}", cpu.describe());
                if let Err(e) = write_memory_dump(&bus.mem, &self.dump_path) {
                    error!("cannot write memory dump: {e}");
                }
                return false;
            }
        };

        self.stats.borrow_mut().record_mli(trap_pc, desc.name);

        let resume = |cpu: &mut CpuState| {
            cpu.sp = cpu.sp.wrapping_add(2);
            cpu.pc = ret_addr.wrapping_add(1).wrapping_add(3);
        };

        let handler = match desc.handler {
            Some(h) => h,
            None => {
                warn!("MLI stub: ${call_num:02X} ({}) not implemented", desc.name);
                set_error(cpu, ProdosError::BadCallNumber);
                resume(cpu);
                return true;
            }
        };

        let inputs = read_input_params(bus, param_list, desc);
        debug!("MLI {} (${call_num:02X}) params={inputs:?}", desc.name);

        let mut outputs = Vec::new();
        let err = handler(self, bus, &inputs, &mut outputs);

        write_output_params(bus, param_list, desc, &outputs);

        if err == ProdosError::NoError {
            set_success(cpu);
        } else {
            debug!(
                "MLI {} failed: ${:02X} ({})",
                desc.name,
                err.code(),
                err.message()
            );
            set_error(cpu, err);
        }
        resume(cpu);
        true
    }

    // ── Refnum helpers ────────────────────────────────────────

    fn alloc_refnum(&self) -> Option<u8> {
        (1..MAX_FILES).find(|&i| self.files[i].is_none()).map(|i| i as u8)
    }

    fn entry_mut(&mut self, refnum: u8) -> Option<&mut OpenFile> {
        if refnum == 0 || refnum as usize >= MAX_FILES {
            return None;
        }
        self.files[refnum as usize].as_mut()
    }

    // ── Handlers ──────────────────────────────────────────────

    /// GET_TIME ($82): pack the host clock into the ProDOS date/time
    /// cells at $BF90-$BF93.
    fn handle_get_time(
        &mut self,
        bus: &mut Bus,
        _inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let now = Local::now();
        let year = (now.year() - 1900) as u8;
        let month = now.month() as u8;
        let day = now.day() as u8;

        let date_hi = (year << 1) | ((month >> 3) & 0x01);
        let date_lo = ((month & 0x07) << 5) | (day & 0x1F);

        bus.write(P8DATE, date_lo);
        bus.write(P8DATE + 1, date_hi);
        bus.write(P8TIME, now.minute() as u8);
        bus.write(P8TIME + 1, now.hour() as u8);

        ProdosError::NoError
    }

    /// GET_FILE_INFO ($C4): stat the host file, inferring the ProDOS
    /// type from the extension. EOF rides in the trailing three-byte
    /// output.
    fn handle_get_file_info(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let host_path = prodos_path_to_host(inputs[0].as_pathname());

        let metadata = match fs::metadata(&host_path) {
            Ok(m) => m,
            Err(_) => {
                // Zero placeholders for all ten outputs; widths come
                // from the descriptor on write-back.
                for _ in 0..9 {
                    outputs.push(ParamValue::Word(0));
                }
                outputs.push(ParamValue::ThreeByte(0));
                return ProdosError::FileNotFound;
            }
        };

        let size = metadata.len() as u32;
        let blocks = ((size + 511) / 512) as u16;
        let ext = host_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        outputs.push(ParamValue::Byte(0xC3)); // access
        outputs.push(ParamValue::Byte(type_from_extension(&ext).code()));
        outputs.push(ParamValue::Word(0x0000)); // aux_type
        outputs.push(ParamValue::Byte(0x01)); // storage_type
        outputs.push(ParamValue::Word(blocks));
        outputs.push(ParamValue::Word(0)); // mod_date
        outputs.push(ParamValue::Word(0)); // mod_time
        outputs.push(ParamValue::Word(0)); // create_date
        outputs.push(ParamValue::Word(0)); // create_time
        outputs.push(ParamValue::ThreeByte(size));
        ProdosError::NoError
    }

    /// SET_PREFIX ($C6): chdir to the supplied directory.
    fn handle_set_prefix(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let mut prodos_path = inputs[0].as_pathname().to_string();
        if prodos_path.is_empty() {
            prodos_path = "/".to_string();
        }
        if prodos_path.len() > MAX_PATHNAME {
            return ProdosError::InvalidPathSyntax;
        }

        let target = prodos_path_to_host(&prodos_path);
        if !target.is_dir() {
            return ProdosError::PathNotFound;
        }
        match env::set_current_dir(&target) {
            Ok(()) => ProdosError::NoError,
            Err(_) => ProdosError::PathNotFound,
        }
    }

    /// GET_PREFIX ($C7): current directory as a length-prefixed string
    /// with a trailing slash, written through the caller's buffer.
    fn handle_get_prefix(
        &mut self,
        bus: &mut Bus,
        inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let buf_ptr = inputs[0].as_word();

        let cwd = match env::current_dir() {
            Ok(d) => d,
            Err(_) => return ProdosError::IoError,
        };
        let mut prefix = cwd.to_string_lossy().into_owned();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        if prefix.len() > MAX_PATHNAME {
            return ProdosError::InvalidPathSyntax;
        }

        bus.write(buf_ptr, prefix.len() as u8);
        for (i, byte) in prefix.bytes().enumerate() {
            bus.write(buf_ptr.wrapping_add(1 + i as u16), byte & 0x7F);
        }
        ProdosError::NoError
    }

    /// OPEN ($C8): read/write with a read-only fallback; lowest free
    /// refnum wins.
    fn handle_open(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let host_path = prodos_path_to_host(inputs[0].as_pathname());

        let refnum = match self.alloc_refnum() {
            Some(r) => r,
            None => return ProdosError::FcbFull,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&host_path)
            .or_else(|_| File::open(&host_path));
        let file = match file {
            Ok(f) => f,
            Err(_) => return ProdosError::FileNotFound,
        };

        let length = file.metadata().map(|m| m.len() as u32).unwrap_or(0);
        debug!(
            "OPEN {} as refnum {refnum}, length {length}",
            host_path.display()
        );

        self.files[refnum as usize] = Some(OpenFile {
            file,
            host_path,
            mark: 0,
            length,
            newline_mask: 0,
            newline_char: 0,
        });
        outputs.push(ParamValue::Byte(refnum));
        ProdosError::NoError
    }

    /// READ ($CA): clamp to the bytes remaining; END_OF_FILE only for
    /// a zero-byte transfer against a non-zero request.
    fn handle_read(
        &mut self,
        bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        let data_buffer = inputs[1].as_word();
        let request_count = inputs[2].as_word();

        let entry = match self.entry_mut(refnum) {
            Some(e) => e,
            None => {
                outputs.push(ParamValue::Word(0));
                return ProdosError::InvalidRefNum;
            }
        };

        if data_buffer as u32 + request_count as u32 > 0x1_0000 {
            outputs.push(ParamValue::Word(0));
            return ProdosError::BadBufferAddr;
        }

        if entry.file.seek(SeekFrom::Start(entry.mark as u64)).is_err() {
            outputs.push(ParamValue::Word(0));
            return ProdosError::IoError;
        }

        let remaining = entry.length.saturating_sub(entry.mark);
        let to_read = (request_count as u32).min(remaining) as usize;

        let mut buffer = vec![0u8; to_read];
        let n = match entry.file.read(&mut buffer) {
            Ok(n) => n,
            Err(_) => {
                outputs.push(ParamValue::Word(0));
                return ProdosError::IoError;
            }
        };
        entry.mark += n as u32;

        for (i, &byte) in buffer[..n].iter().enumerate() {
            bus.write(data_buffer.wrapping_add(i as u16), byte);
        }

        debug!("READ refnum {refnum}: {n} bytes, mark now {}", self.files[refnum as usize].as_ref().map_or(0, |e| e.mark));
        outputs.push(ParamValue::Word(n as u16));

        if n == 0 && request_count > 0 {
            ProdosError::EndOfFile
        } else {
            ProdosError::NoError
        }
    }

    /// WRITE ($CB): a short host write reports DISK_FULL.
    fn handle_write(
        &mut self,
        bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        let data_buffer = inputs[1].as_word();
        let request_count = inputs[2].as_word();

        if data_buffer as u32 + request_count as u32 > 0x1_0000 {
            return ProdosError::BadBufferAddr;
        }

        let mut buffer = Vec::with_capacity(request_count as usize);
        for i in 0..request_count {
            buffer.push(bus.mem.read(data_buffer.wrapping_add(i)));
        }

        let entry = match self.entry_mut(refnum) {
            Some(e) => e,
            None => return ProdosError::InvalidRefNum,
        };

        if entry.file.seek(SeekFrom::Start(entry.mark as u64)).is_err() {
            return ProdosError::IoError;
        }

        let written = match entry.file.write(&buffer) {
            Ok(n) => n as u16,
            Err(_) => return ProdosError::IoError,
        };

        entry.mark += written as u32;
        if entry.mark > entry.length {
            entry.length = entry.mark;
        }
        outputs.push(ParamValue::Word(written));

        if written < request_count {
            ProdosError::DiskFull
        } else {
            ProdosError::NoError
        }
    }

    /// CLOSE ($CC): refnum 0 closes everything.
    fn handle_close(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        if refnum == 0 {
            self.close_all();
            return ProdosError::NoError;
        }
        match self.entry_mut(refnum) {
            Some(entry) => {
                debug!("CLOSE refnum {refnum}: {}", entry.host_path.display());
            }
            None => return ProdosError::InvalidRefNum,
        }
        self.files[refnum as usize] = None;
        ProdosError::NoError
    }

    /// FLUSH ($CD): refnum 0 flushes everything.
    fn handle_flush(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        if refnum == 0 {
            for entry in self.files.iter_mut().flatten() {
                let _ = entry.file.flush();
            }
            return ProdosError::NoError;
        }
        match self.entry_mut(refnum) {
            Some(entry) => {
                let _ = entry.file.flush();
                ProdosError::NoError
            }
            None => ProdosError::InvalidRefNum,
        }
    }

    /// SET_MARK ($CE): clamp into [0, length].
    fn handle_set_mark(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        _outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        let position = inputs[1].as_three_byte();
        match self.entry_mut(refnum) {
            Some(entry) => {
                entry.mark = position.min(entry.length);
                ProdosError::NoError
            }
            None => ProdosError::InvalidRefNum,
        }
    }

    fn handle_get_mark(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        match self.entry_mut(refnum) {
            Some(entry) => {
                outputs.push(ParamValue::ThreeByte(entry.mark));
                ProdosError::NoError
            }
            None => ProdosError::InvalidRefNum,
        }
    }

    /// GET_EOF ($D1): current length as a three-byte value.
    fn handle_get_eof(
        &mut self,
        _bus: &mut Bus,
        inputs: &[ParamValue],
        outputs: &mut Vec<ParamValue>,
    ) -> ProdosError {
        let refnum = inputs[0].as_byte();
        match self.entry_mut(refnum) {
            Some(entry) => {
                outputs.push(ParamValue::ThreeByte(entry.length));
                ProdosError::NoError
            }
            None => ProdosError::InvalidRefNum,
        }
    }
}

// ── CPU result flags ──────────────────────────────────────────

fn set_success(cpu: &mut CpuState) {
    cpu.a = 0;
    cpu.p.remove(Status::C | Status::N | Status::V);
    cpu.p.insert(Status::Z | Status::U);
}

fn set_error(cpu: &mut CpuState, err: ProdosError) {
    cpu.a = err.code();
    cpu.p.insert(Status::C | Status::U);
    cpu.p.remove(Status::Z);
}

// ── Path translation ──────────────────────────────────────────

/// 1:1 mapping: an absolute ProDOS path is the same host path; a
/// relative one resolves against the host CWD.
fn prodos_path_to_host(prodos_path: &str) -> PathBuf {
    if prodos_path.starts_with('/') {
        PathBuf::from(prodos_path)
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(prodos_path)
    }
}

// ── Parameter marshalling ─────────────────────────────────────

fn read_pathname(bus: &Bus, ptr: u16) -> String {
    let len = bus.mem.read(ptr) as usize;
    let len = len.min(MAX_PATHNAME);
    let mut name = String::with_capacity(len);
    for i in 0..len {
        name.push(bus.mem.read(ptr.wrapping_add(1 + i as u16)) as char);
    }
    name
}

/// Read the parameter list per the descriptor. INPUT and INPUT_OUTPUT
/// values are materialized (pathnames dereferenced); OUTPUT pointers
/// are read so handlers know where to write; OUTPUT values are
/// skipped.
fn read_input_params(bus: &Bus, param_list: u16, desc: &CallDescriptor) -> Vec<ParamValue> {
    let mut values = Vec::new();
    let mut offset = 1u16; // skip the count byte

    for param in desc.params {
        let addr = param_list.wrapping_add(offset);
        if param.direction == Out {
            if param.ptype.is_pointer() {
                let ptr =
                    bus.mem.read(addr) as u16 | ((bus.mem.read(addr.wrapping_add(1)) as u16) << 8);
                values.push(ParamValue::Pointer(ptr));
            }
            offset += param.ptype.size();
            continue;
        }

        match param.ptype {
            Byte | RefNum => values.push(ParamValue::Byte(bus.mem.read(addr))),
            Word => values.push(ParamValue::Word(
                bus.mem.read(addr) as u16 | ((bus.mem.read(addr.wrapping_add(1)) as u16) << 8),
            )),
            ThreeByte => values.push(ParamValue::ThreeByte(
                bus.mem.read(addr) as u32
                    | ((bus.mem.read(addr.wrapping_add(1)) as u32) << 8)
                    | ((bus.mem.read(addr.wrapping_add(2)) as u32) << 16),
            )),
            PathnamePtr => {
                let ptr =
                    bus.mem.read(addr) as u16 | ((bus.mem.read(addr.wrapping_add(1)) as u16) << 8);
                values.push(ParamValue::Pathname(read_pathname(bus, ptr)));
            }
            BufferPtr => {
                let ptr =
                    bus.mem.read(addr) as u16 | ((bus.mem.read(addr.wrapping_add(1)) as u16) << 8);
                values.push(ParamValue::Pointer(ptr));
            }
        }
    }

    values
}

/// Write handler outputs back into the parameter list, in descriptor
/// order. Pointer parameters are skipped (the handler already wrote
/// through them); missing outputs leave the guest bytes untouched.
fn write_output_params(
    bus: &mut Bus,
    param_list: u16,
    desc: &CallDescriptor,
    values: &[ParamValue],
) {
    let mut offset = 1u16;
    let mut out_idx = 0usize;

    for param in desc.params {
        let addr = param_list.wrapping_add(offset);
        let size = param.ptype.size();

        if param.direction == In || param.ptype.is_pointer() {
            offset += size;
            continue;
        }

        let value = match values.get(out_idx) {
            Some(v) => v,
            None => {
                offset += size;
                continue;
            }
        };
        out_idx += 1;

        match param.ptype {
            Byte | RefNum => bus.write(addr, value.as_byte()),
            Word => {
                let v = value.as_word();
                bus.write(addr, (v & 0xFF) as u8);
                bus.write(addr.wrapping_add(1), (v >> 8) as u8);
            }
            ThreeByte => {
                let v = value.as_three_byte();
                bus.write(addr, (v & 0xFF) as u8);
                bus.write(addr.wrapping_add(1), ((v >> 8) & 0xFF) as u8);
                bus.write(addr.wrapping_add(2), ((v >> 16) & 0xFF) as u8);
            }
            PathnamePtr | BufferPtr => {}
        }
        offset += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::cpu::Cpu;
    use crate::emulator::traps::TrapStatistics;
    use std::path::Path;

    /// Set up CPU + bus as if the guest had just executed `JSR $BF00`
    /// with the given inline call number and parameter list address.
    fn call_frame(bus: &mut Bus, cpu: &mut Cpu, call_num: u8, param_list: u16) {
        let call_site: u16 = 0x0301;
        bus.write(call_site, call_num);
        bus.write(call_site + 1, (param_list & 0xFF) as u8);
        bus.write(call_site + 2, (param_list >> 8) as u8);
        // JSR pushed $0300 (address of the JSR's last byte).
        bus.write(0x01FF, 0x03);
        bus.write(0x01FE, 0x00);
        cpu.state.sp = 0xFD;
        cpu.state.pc = MLI_ENTRY;
    }

    fn mli_and_bus() -> (SharedMli, Bus, Cpu) {
        let stats = TrapStatistics::shared();
        let mli = Mli::shared(stats, PathBuf::from("/tmp/edasm_mli_test_dump.bin"));
        (mli, Bus::new(), Cpu::new())
    }

    fn dispatch(mli: &SharedMli, cpu: &mut Cpu, bus: &mut Bus) -> bool {
        mli.borrow_mut().dispatch(&mut cpu.state, bus, MLI_ENTRY)
    }

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = env::temp_dir().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write a length-prefixed pathname into guest memory.
    fn put_pathname(bus: &mut Bus, at: u16, path: &Path) {
        let s = path.to_string_lossy();
        bus.write(at, s.len() as u8);
        for (i, b) in s.bytes().enumerate() {
            bus.write(at + 1 + i as u16, b);
        }
    }

    #[test]
    fn test_error_code_round_trip() {
        let all = [
            ProdosError::NoError,
            ProdosError::BadCallNumber,
            ProdosError::IoError,
            ProdosError::FcbFull,
            ProdosError::InvalidRefNum,
            ProdosError::FileNotFound,
            ProdosError::DiskFull,
            ProdosError::EndOfFile,
            ProdosError::BadBufferAddr,
            ProdosError::BitmapImpossible,
        ];
        for err in all {
            assert_eq!(ProdosError::from_code(err.code()), Some(err));
        }
        assert_eq!(ProdosError::from_code(0xFF), None);
    }

    #[test]
    fn test_descriptor_lookup() {
        assert_eq!(call_descriptor(0xC8).unwrap().name, "OPEN");
        assert_eq!(call_descriptor(0x82).unwrap().name, "GET_TIME");
        assert!(call_descriptor(0x99).is_none());
    }

    #[test]
    fn test_stub_call_returns_bad_call_number() {
        let (mli, mut bus, mut cpu) = mli_and_bus();
        // QUIT ($65) is a recognized stub.
        bus.write(0x4000, 4);
        call_frame(&mut bus, &mut cpu, 0x65, 0x4000);

        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0x01);
        assert!(cpu.state.p.contains(Status::C));
        // Resumed past JSR + 3 inline bytes.
        assert_eq!(cpu.state.pc, 0x0304);
        assert_eq!(cpu.state.sp, 0xFF);
    }

    #[test]
    fn test_unknown_call_halts() {
        let (mli, mut bus, mut cpu) = mli_and_bus();
        call_frame(&mut bus, &mut cpu, 0x99, 0x4000);
        assert!(!dispatch(&mli, &mut cpu, &mut bus));
    }

    #[test]
    fn test_get_time_writes_system_page() {
        let (mli, mut bus, mut cpu) = mli_and_bus();
        call_frame(&mut bus, &mut cpu, 0x82, 0x0000);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0);
        assert!(!cpu.state.p.contains(Status::C));

        let minute = bus.read(P8TIME);
        let hour = bus.read(P8TIME + 1);
        assert!(minute < 60);
        assert!(hour < 24);

        let date_lo = bus.read(P8DATE);
        let day = date_lo & 0x1F;
        assert!((1..=31).contains(&day));
    }

    #[test]
    fn test_open_read_close_scenario() {
        let path = temp_file("edasm_mli_scenario.txt", b"Line 1\rLine 2\r");
        let (mli, mut bus, mut cpu) = mli_and_bus();

        // OPEN: param list at $4000 {count, path_ptr, io_buf, ref_num}.
        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);
        bus.write(0x4005, 0);
        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0, "OPEN failed");
        let refnum = bus.read(0x4005);
        assert!((1..=15).contains(&refnum));

        // READ 100 bytes into $4100.
        bus.write(0x4010, 4);
        bus.write(0x4011, refnum);
        bus.write_word(0x4012, 0x4100);
        bus.write_word(0x4014, 100);
        bus.write_word(0x4016, 0);
        call_frame(&mut bus, &mut cpu, 0xCA, 0x4010);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0);
        let trans = bus.read(0x4016) as u16 | ((bus.read(0x4017) as u16) << 8);
        assert_eq!(trans, 14);
        for (i, &b) in b"Line 1\rLine 2\r".iter().enumerate() {
            assert_eq!(bus.read(0x4100 + i as u16), b);
        }

        // READ 1 more byte: zero transfer, END_OF_FILE.
        bus.write_word(0x4014, 1);
        call_frame(&mut bus, &mut cpu, 0xCA, 0x4010);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0x4C);
        assert!(cpu.state.p.contains(Status::C));
        let trans = bus.read(0x4016) as u16 | ((bus.read(0x4017) as u16) << 8);
        assert_eq!(trans, 0);

        // CLOSE.
        bus.write(0x4020, 1);
        bus.write(0x4021, refnum);
        call_frame(&mut bus, &mut cpu, 0xCC, 0x4020);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0);
        assert_eq!(mli.borrow().open_file_count(), 0);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_read_clamps_to_remaining() {
        let path = temp_file("edasm_mli_clamp.txt", b"12345");
        let (mli, mut bus, mut cpu) = mli_and_bus();

        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);
        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        let refnum = bus.read(0x4005);

        // Ask for 100, get 5, NO_ERROR.
        bus.write(0x4010, 4);
        bus.write(0x4011, refnum);
        bus.write_word(0x4012, 0x4100);
        bus.write_word(0x4014, 100);
        call_frame(&mut bus, &mut cpu, 0xCA, 0x4010);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0);
        let trans = bus.read(0x4016) as u16 | ((bus.read(0x4017) as u16) << 8);
        assert_eq!(trans, 5);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_set_mark_clamps_and_get_eof() {
        let path = temp_file("edasm_mli_mark.txt", b"abcdef");
        let (mli, mut bus, mut cpu) = mli_and_bus();

        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);
        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        dispatch(&mli, &mut cpu, &mut bus);
        let refnum = bus.read(0x4005);

        // SET_MARK way past EOF clamps to the length.
        bus.write(0x4010, 2);
        bus.write(0x4011, refnum);
        bus.write(0x4012, 0xFF);
        bus.write(0x4013, 0xFF);
        bus.write(0x4014, 0x00);
        call_frame(&mut bus, &mut cpu, 0xCE, 0x4010);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(cpu.state.a, 0);

        // GET_MARK returns the clamped position.
        bus.write(0x4020, 2);
        bus.write(0x4021, refnum);
        call_frame(&mut bus, &mut cpu, 0xCF, 0x4020);
        dispatch(&mli, &mut cpu, &mut bus);
        let mark = bus.read(0x4022) as u32
            | ((bus.read(0x4023) as u32) << 8)
            | ((bus.read(0x4024) as u32) << 16);
        assert_eq!(mark, 6);

        // GET_EOF reports the file length.
        bus.write(0x4030, 2);
        bus.write(0x4031, refnum);
        call_frame(&mut bus, &mut cpu, 0xD1, 0x4030);
        dispatch(&mli, &mut cpu, &mut bus);
        let eof = bus.read(0x4032) as u32
            | ((bus.read(0x4033) as u32) << 8)
            | ((bus.read(0x4034) as u32) << 16);
        assert_eq!(eof, 6);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_write_extends_file() {
        let path = temp_file("edasm_mli_write.txt", b"");
        let (mli, mut bus, mut cpu) = mli_and_bus();

        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);
        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        dispatch(&mli, &mut cpu, &mut bus);
        let refnum = bus.read(0x4005);

        // Stage the payload at $4100 and WRITE it.
        for (i, b) in b"hello".iter().enumerate() {
            bus.write(0x4100 + i as u16, *b);
        }
        bus.write(0x4010, 4);
        bus.write(0x4011, refnum);
        bus.write_word(0x4012, 0x4100);
        bus.write_word(0x4014, 5);
        call_frame(&mut bus, &mut cpu, 0xCB, 0x4010);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(cpu.state.a, 0);
        let trans = bus.read(0x4016) as u16 | ((bus.read(0x4017) as u16) << 8);
        assert_eq!(trans, 5);

        // CLOSE all, then verify on the host side.
        bus.write(0x4020, 1);
        bus.write(0x4021, 0);
        call_frame(&mut bus, &mut cpu, 0xCC, 0x4020);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_invalid_refnum_errors() {
        let (mli, mut bus, mut cpu) = mli_and_bus();
        bus.write(0x4010, 4);
        bus.write(0x4011, 9); // never opened
        bus.write_word(0x4012, 0x4100);
        bus.write_word(0x4014, 10);
        call_frame(&mut bus, &mut cpu, 0xCA, 0x4010);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, ProdosError::InvalidRefNum.code());
        assert!(cpu.state.p.contains(Status::C));
    }

    #[test]
    fn test_open_missing_file() {
        let (mli, mut bus, mut cpu) = mli_and_bus();
        put_pathname(&mut bus, 0x5000, Path::new("/nonexistent/edasm_no_such"));
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);
        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, ProdosError::FileNotFound.code());
    }

    #[test]
    fn test_get_file_info() {
        let path = temp_file("edasm_mli_info.bin", &[0u8; 600]);
        let (mli, mut bus, mut cpu) = mli_and_bus();

        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 10);
        bus.write_word(0x4001, 0x5000);
        call_frame(&mut bus, &mut cpu, 0xC4, 0x4000);
        assert!(dispatch(&mli, &mut cpu, &mut bus));
        assert_eq!(cpu.state.a, 0);

        assert_eq!(bus.read(0x4003), 0xC3); // access
        assert_eq!(bus.read(0x4004), 0x06); // BIN from extension
        let blocks = bus.read(0x4008) as u16 | ((bus.read(0x4009) as u16) << 8);
        assert_eq!(blocks, 2); // ceil(600 / 512)
        // EOF rides after create_time, at offset 18.
        let eof = bus.read(0x4012) as u32
            | ((bus.read(0x4013) as u32) << 8)
            | ((bus.read(0x4014) as u32) << 16);
        assert_eq!(eof, 600);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_lowest_free_refnum_allocated() {
        let path = temp_file("edasm_mli_refnum.txt", b"x");
        let (mli, mut bus, mut cpu) = mli_and_bus();

        put_pathname(&mut bus, 0x5000, &path);
        bus.write(0x4000, 3);
        bus.write_word(0x4001, 0x5000);
        bus.write_word(0x4003, 0x0800);

        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(bus.read(0x4005), 1);

        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(bus.read(0x4005), 2);

        // Close #1; the next open reuses it.
        bus.write(0x4020, 1);
        bus.write(0x4021, 1);
        call_frame(&mut bus, &mut cpu, 0xCC, 0x4020);
        dispatch(&mli, &mut cpu, &mut bus);

        call_frame(&mut bus, &mut cpu, 0xC8, 0x4000);
        dispatch(&mli, &mut cpu, &mut bus);
        assert_eq!(bus.read(0x4005), 1);

        let _ = fs::remove_file(path);
    }
}
