use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{FileExt, MetadataExt};

use nix::unistd::getppid;

use super::smaps::SmapsParser;
use super::stat::{parse_stat, ProcessStat};
use super::types::MemoryRegion;
use crate::error::{CoreError, ProcContext, Result};

pub fn get_pid_by_name(process_name: &str) -> Result<i32> {
    let proc_dir = std::fs::read_dir("/proc").proc_path("/proc")?;

    // Our own command line and our launcher's (sudo, a shell -c) name the
    // target too.
    let skipped = [std::process::id() as i32, getppid().as_raw()];

    for entry in proc_dir {
        let entry = entry?;
        let file_name = entry.file_name();
        let pid_str = file_name.to_string_lossy();

        if let Ok(pid) = pid_str.parse::<i32>() {
            if skipped.contains(&pid) {
                continue;
            }
            let cmdline_path = format!("/proc/{}/cmdline", pid);
            if let Ok(cmdline) = std::fs::read(&cmdline_path) {
                if String::from_utf8_lossy(&cmdline).contains(process_name) {
                    return Ok(pid);
                }
            }
        }
    }

    Err(CoreError::NamedProcessNotFound(process_name.to_string()))
}

/// Thread ids listed under `/proc/<pid>/task`, ascending.
pub fn list_tasks(pid: i32) -> Result<Vec<i32>> {
    let task_dir = format!("/proc/{}/task", pid);
    let entries = match std::fs::read_dir(&task_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CoreError::ProcessNotFound(pid)),
        Err(source) => {
            return Err(CoreError::ProcRead {
                path: task_dir.into(),
                source,
            })
        }
    };

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.proc_path(&task_dir)?;
        // A task entry that is not a number means procfs is not what we think it is.
        let tid = entry
            .file_name()
            .to_string_lossy()
            .parse::<i32>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .proc_path(entry.path())?;
        tids.push(tid);
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Reads the process stat record, or a single thread's when `tid` is given.
pub fn read_stat(pid: i32, tid: Option<i32>) -> Result<ProcessStat> {
    let path = match tid {
        Some(tid) => format!("/proc/{}/task/{}/stat", pid, tid),
        None => format!("/proc/{}/stat", pid),
    };
    let text = std::fs::read_to_string(&path).proc_path(path)?;
    parse_stat(&text)
}

pub fn read_smaps(pid: i32) -> Result<Vec<MemoryRegion>> {
    let path = format!("/proc/{}/smaps", pid);
    let file = File::open(&path).proc_path(&path)?;
    SmapsParser::new().parse(BufReader::new(file))
}

pub fn read_auxv(pid: i32) -> Result<Vec<u8>> {
    let path = format!("/proc/{}/auxv", pid);
    std::fs::read(&path).proc_path(path)
}

pub fn read_cmdline(pid: i32) -> Result<String> {
    let path = format!("/proc/{}/cmdline", pid);
    let raw = std::fs::read(&path).proc_path(path)?;
    Ok(sanitize_cmdline(&raw))
}

/// NUL separated arguments become one space separated, trimmed line.
pub fn sanitize_cmdline(raw: &[u8]) -> String {
    let joined: Vec<u8> = raw.iter().map(|&b| if b == 0 { b' ' } else { b }).collect();
    String::from_utf8_lossy(&joined).trim().to_string()
}

/// Owner uid and gid of `/proc/<pid>`, i.e. the process credentials.
pub fn process_owner(pid: i32) -> Result<(u32, u32)> {
    let path = format!("/proc/{}", pid);
    let meta = std::fs::metadata(&path).proc_path(path)?;
    Ok((meta.uid(), meta.gid()))
}

/// Random access handle on `/proc/<pid>/mem`.
pub struct ProcessMemory {
    mem_fd: File,
}

impl ProcessMemory {
    pub fn open(pid: i32) -> Result<Self> {
        let path = format!("/proc/{}/mem", pid);
        let mem_fd = File::open(&path).proc_path(path)?;
        Ok(Self { mem_fd })
    }

    /// A reader over `[start, start + len)` of the address space.
    pub fn section(&self, start: u64, len: u64) -> MemorySection<'_> {
        MemorySection {
            mem_fd: &self.mem_fd,
            pos: start,
            remaining: len,
        }
    }
}

pub struct MemorySection<'a> {
    mem_fd: &'a File,
    pos: u64,
    remaining: u64,
}

impl Read for MemorySection<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        let n = self.mem_fd.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}
