//! Kernel ABI record images for x86_64 core notes.
//!
//! Every record is written field by field at its documented offset.

use byteorder::{LittleEndian, WriteBytesExt};
use nix::libc::user_regs_struct;
use std::io;

use crate::utils::ProcessStat;

/// Ordering of the state characters used for `pr_state`.
pub const STATE_ORDER: &[u8] = b"RSDTtZXxKWP";

const FNAME_LEN: usize = 16;
const PSARGS_LEN: usize = 80;

/// `struct elf_prpsinfo`.
///
/// | offset | field                          |
/// |--------|--------------------------------|
/// | 0      | state, sname, zomb, nice: i8   |
/// | 4      | padding                        |
/// | 8      | flag: u64                      |
/// | 16     | uid, gid: u32                  |
/// | 24     | pid, ppid, pgrp, sid: i32      |
/// | 40     | fname: [u8; 16]                |
/// | 56     | psargs: [u8; 80]               |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrPsInfo {
    pub state: i8,
    pub sname: u8,
    pub zombie: bool,
    pub nice: i8,
    pub flag: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub sid: i32,
    pub fname: String,
    pub psargs: String,
}

impl PrPsInfo {
    pub const SIZE: usize = 136;

    pub fn new(stat: &ProcessStat, uid: u32, gid: u32, cmdline: String) -> Self {
        let state = STATE_ORDER
            .iter()
            .position(|&c| c == stat.state)
            .map_or(-1, |i| i as i8);

        PrPsInfo {
            state,
            sname: stat.state,
            zombie: stat.state == b'Z',
            nice: stat.nice as i8,
            flag: u64::from(stat.flags),
            uid,
            gid,
            pid: stat.pid,
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            sid: stat.session,
            fname: stat.comm.clone(),
            psargs: cmdline,
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_i8(self.state)?;
        buf.write_u8(self.sname)?;
        buf.write_u8(self.zombie as u8)?;
        buf.write_i8(self.nice)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.flag)?;
        buf.write_u32::<LittleEndian>(self.uid)?;
        buf.write_u32::<LittleEndian>(self.gid)?;
        for id in [self.pid, self.ppid, self.pgrp, self.sid] {
            buf.write_i32::<LittleEndian>(id)?;
        }
        put_fixed(&mut buf, self.fname.as_bytes(), FNAME_LEN, FNAME_LEN);
        // Keep a terminating NUL in the argument string.
        put_fixed(&mut buf, self.psargs.as_bytes(), PSARGS_LEN - 1, PSARGS_LEN);
        debug_assert_eq!(buf.len(), Self::SIZE);
        Ok(buf)
    }
}

fn put_fixed(buf: &mut Vec<u8>, bytes: &[u8], max: usize, width: usize) {
    let n = bytes.len().min(max);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + width - n, 0);
}

/// `struct timeval` split out of a microsecond count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

impl TimeVal {
    pub fn from_micros(micros: i64) -> Self {
        TimeVal {
            sec: micros / 1_000_000,
            usec: micros % 1_000_000,
        }
    }
}

/// Number of general purpose registers in `user_regs_struct`.
pub const GP_REG_COUNT: usize = 27;

/// Flattens `user_regs_struct` in its declaration order.
pub fn gp_registers(regs: &user_regs_struct) -> [u64; GP_REG_COUNT] {
    [
        regs.r15,
        regs.r14,
        regs.r13,
        regs.r12,
        regs.rbp,
        regs.rbx,
        regs.r11,
        regs.r10,
        regs.r9,
        regs.r8,
        regs.rax,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.orig_rax,
        regs.rip,
        regs.cs,
        regs.eflags,
        regs.rsp,
        regs.ss,
        regs.fs_base,
        regs.gs_base,
        regs.ds,
        regs.es,
        regs.fs,
        regs.gs,
    ]
}

/// `struct elf_prstatus`.
///
/// | offset | field                                   |
/// |--------|-----------------------------------------|
/// | 0      | info: signo, code, errno: i32           |
/// | 12     | cursig: i16, 2 bytes padding            |
/// | 16     | sigpend, sighold: u64                   |
/// | 32     | pid, ppid, pgrp, sid: i32               |
/// | 48     | utime, stime, cutime, cstime: timeval   |
/// | 112    | reg: [u64; 27]                          |
/// | 328    | fpvalid: i32, 4 bytes padding           |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrStatus {
    pub signo: i32,
    pub code: i32,
    pub errno: i32,
    pub cursig: i16,
    pub sigpend: u64,
    pub sighold: u64,
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub sid: i32,
    pub utime: TimeVal,
    pub stime: TimeVal,
    pub cutime: TimeVal,
    pub cstime: TimeVal,
    pub reg: [u64; GP_REG_COUNT],
    pub fpvalid: i32,
}

impl PrStatus {
    pub const SIZE: usize = 336;

    /// Fills everything but the registers from a thread's stat record.
    pub fn from_stat(stat: &ProcessStat) -> Self {
        PrStatus {
            sigpend: stat.signal,
            sighold: stat.blocked,
            pid: stat.pid,
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            sid: stat.session,
            utime: TimeVal::from_micros(stat.utime as i64),
            stime: TimeVal::from_micros(stat.stime as i64),
            cutime: TimeVal::from_micros(stat.cutime),
            cstime: TimeVal::from_micros(stat.cstime),
            fpvalid: 1,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_i32::<LittleEndian>(self.signo)?;
        buf.write_i32::<LittleEndian>(self.code)?;
        buf.write_i32::<LittleEndian>(self.errno)?;
        buf.write_i16::<LittleEndian>(self.cursig)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u64::<LittleEndian>(self.sigpend)?;
        buf.write_u64::<LittleEndian>(self.sighold)?;
        for id in [self.pid, self.ppid, self.pgrp, self.sid] {
            buf.write_i32::<LittleEndian>(id)?;
        }
        for tv in [self.utime, self.stime, self.cutime, self.cstime] {
            buf.write_i64::<LittleEndian>(tv.sec)?;
            buf.write_i64::<LittleEndian>(tv.usec)?;
        }
        for reg in self.reg {
            buf.write_u64::<LittleEndian>(reg)?;
        }
        buf.write_i32::<LittleEndian>(self.fpvalid)?;
        buf.write_u32::<LittleEndian>(0)?;
        debug_assert_eq!(buf.len(), Self::SIZE);
        Ok(buf)
    }
}

/// One mapping in the `NT_FILE` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub start: u64,
    pub end: u64,
    pub offset_pages: u64,
    pub path: String,
}

/// `NT_FILE` body: count and page size, the address triples, then the paths.
pub fn encode_file_table(mappings: &[FileMapping], page_size: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u64::<LittleEndian>(mappings.len() as u64)?;
    buf.write_u64::<LittleEndian>(page_size)?;
    for m in mappings {
        buf.write_u64::<LittleEndian>(m.start)?;
        buf.write_u64::<LittleEndian>(m.end)?;
        buf.write_u64::<LittleEndian>(m.offset_pages)?;
    }
    for m in mappings {
        buf.extend_from_slice(m.path.as_bytes());
        buf.push(0);
    }
    Ok(buf)
}
