use byteorder::{LittleEndian, WriteBytesExt};
use nix::errno::Errno;
use nix::libc::{self, c_void};
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::io::{self, Write};
use std::ptr;

use super::ptrace::{TraceOp, Tracer};
use super::records::{encode_file_table, gp_registers, FileMapping, PrPsInfo, PrStatus};
use crate::error::Result;
use crate::utils::{process_owner, read_auxv, read_cmdline, read_stat, MemoryRegion};

pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRFPREG: u32 = 2;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;
pub const NT_X86_XSTATE: u32 = 0x202;
pub const NT_SIGINFO: u32 = 0x5349_4749;
pub const NT_FILE: u32 = 0x4649_4c45;

const CORE: &str = "CORE";
const LINUX: &str = "LINUX";

/// `sizeof(struct user_fpregs_struct)`.
const FPREGS_SIZE: usize = 512;
/// Largest XSAVE area the kernel hands out for `NT_X86_XSTATE`.
const XSTATE_MAX_SIZE: usize = 2696;
/// `sizeof(siginfo_t)`.
const SIGINFO_SIZE: usize = 128;

/// Page size the `NT_FILE` offsets are expressed in.
pub const FILE_NOTE_PAGE_SIZE: u64 = 0x1000;

/// One ELF note: owner name, type and descriptor bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub name: &'static str,
    pub kind: u32,
    pub desc: Vec<u8>,
}

impl Note {
    fn core(kind: u32, desc: Vec<u8>) -> Self {
        Note { name: CORE, kind, desc }
    }

    /// Writes the note header, the NUL terminated name and the descriptor,
    /// each of the latter two padded to 4 bytes.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let name_len = self.name.len() + 1;
        w.write_u32::<LittleEndian>(name_len as u32)?;
        w.write_u32::<LittleEndian>(self.desc.len() as u32)?;
        w.write_u32::<LittleEndian>(self.kind)?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(&[0u8; 4][..1 + pad4(name_len)])?;
        w.write_all(&self.desc)?;
        w.write_all(&[0u8; 3][..pad4(self.desc.len())])
    }
}

fn check(rc: libc::c_long) -> nix::Result<libc::c_long> {
    if rc == -1 {
        Err(Errno::last())
    } else {
        Ok(rc)
    }
}

fn pad4(len: usize) -> usize {
    len.wrapping_neg() & 3
}

/// `NT_PRPSINFO` for the whole process.
pub fn process_info(pid: i32) -> Result<Note> {
    let stat = read_stat(pid, None)?;
    let (uid, gid) = process_owner(pid)?;
    let cmdline = read_cmdline(pid)?;
    let info = PrPsInfo::new(&stat, uid, gid, cmdline);
    Ok(Note::core(NT_PRPSINFO, info.encode()?))
}

/// `NT_PRSTATUS`: signal masks and times from the thread's stat record plus
/// its general purpose registers.
pub fn thread_status(tracer: &Tracer, pid: i32, tid: i32) -> Result<Note> {
    let stat = read_stat(pid, Some(tid))?;
    let mut status = PrStatus::from_stat(&stat);

    let target = Pid::from_raw(tid);
    let regs = tracer.run(TraceOp::GetRegs, tid, move || ptrace::getregs(target))?;
    status.reg = gp_registers(&regs);

    Ok(Note::core(NT_PRSTATUS, status.encode()?))
}

/// `NT_PRFPREG`: the raw `user_fpregs_struct`.
pub fn fp_registers(tracer: &Tracer, tid: i32) -> Result<Note> {
    let desc = tracer.run(TraceOp::GetFpRegs, tid, move || {
        let mut buf = vec![0u8; FPREGS_SIZE];
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                tid,
                ptr::null_mut::<c_void>(),
                buf.as_mut_ptr().cast::<c_void>(),
            )
        };
        check(rc).map(|_| buf)
    })?;
    Ok(Note::core(NT_PRFPREG, desc))
}

/// `NT_X86_XSTATE`, trimmed to the length the kernel reports.
pub fn extended_state(tracer: &Tracer, tid: i32) -> Result<Note> {
    let desc = tracer.run(TraceOp::GetRegSet, tid, move || {
        let mut buf = vec![0u8; XSTATE_MAX_SIZE];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<c_void>(),
            iov_len: buf.len(),
        };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid,
                NT_X86_XSTATE as usize as *mut c_void,
                (&mut iov as *mut libc::iovec).cast::<c_void>(),
            )
        };
        check(rc)?;
        buf.truncate(iov.iov_len);
        Ok(buf)
    })?;
    Ok(Note {
        name: LINUX,
        kind: NT_X86_XSTATE,
        desc,
    })
}

/// `struct ptrace_peeksiginfo_args`.
#[repr(C)]
struct PeekSigInfoArgs {
    off: u64,
    flags: u32,
    nr: i32,
}

/// `NT_SIGINFO`: the first queued signal, or zeroes when none is queued.
pub fn signal_info(tracer: &Tracer, tid: i32) -> Result<Note> {
    let desc = tracer.run(TraceOp::PeekSigInfo, tid, move || {
        let mut buf = vec![0u8; SIGINFO_SIZE];
        let mut args = PeekSigInfoArgs { off: 0, flags: 0, nr: 1 };
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKSIGINFO,
                tid,
                (&mut args as *mut PeekSigInfoArgs).cast::<c_void>(),
                buf.as_mut_ptr().cast::<c_void>(),
            )
        };
        check(rc).map(|_| buf)
    })?;
    Ok(Note::core(NT_SIGINFO, desc))
}

/// `NT_AUXV`, unmodified.
pub fn auxv(pid: i32) -> Result<Note> {
    Ok(Note::core(NT_AUXV, read_auxv(pid)?))
}

/// `NT_FILE` listing every region backed by a named file.
pub fn mapped_files(regions: &[MemoryRegion]) -> Result<Note> {
    let mappings: Vec<FileMapping> = regions
        .iter()
        .filter(|r| r.is_file_backed())
        .map(|r| FileMapping {
            start: r.start,
            end: r.end,
            offset_pages: r.offset / FILE_NOTE_PAGE_SIZE,
            path: r.pathname.clone(),
        })
        .collect();
    Ok(Note::core(NT_FILE, encode_file_table(&mappings, FILE_NOTE_PAGE_SIZE)?))
}

/// Every note of the image, serialized back to back: process info, then per
/// thread status, FP registers, extended state and signal info, then the
/// auxiliary vector and the mapped file table.
pub fn build_notes(tracer: &Tracer, pid: i32, tids: &[i32], regions: &[MemoryRegion]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    process_info(pid)?.write(&mut buf)?;

    for &tid in tids {
        thread_status(tracer, pid, tid)?.write(&mut buf)?;
        fp_registers(tracer, tid)?.write(&mut buf)?;
        extended_state(tracer, tid)?.write(&mut buf)?;
        signal_info(tracer, tid)?.write(&mut buf)?;
    }

    auxv(pid)?.write(&mut buf)?;
    mapped_files(regions)?.write(&mut buf)?;

    log::debug!("Notes for {} threads take {} bytes", tids.len(), buf.len());
    Ok(buf)
}
