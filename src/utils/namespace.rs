//! Joining the target's pid and mount namespaces.
//!
//! A process inside a container is only reachable through its own procfs view,
//! and its pid there differs from the one the caller sees.

use log::{debug, info};
use nix::sched::{setns, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::error::{CoreError, ProcContext, Result};

fn ns_link(pid: Option<i32>, ns: &str) -> Result<PathBuf> {
    let path = match pid {
        Some(pid) => format!("/proc/{}/ns/{}", pid, ns),
        None => format!("/proc/self/ns/{}", ns),
    };
    std::fs::read_link(&path).proc_path(path)
}

/// Whether `pid` lives in a different `ns` namespace than we do.
pub fn differs(pid: i32, ns: &str) -> Result<bool> {
    Ok(ns_link(None, ns)? != ns_link(Some(pid), ns)?)
}

/// Innermost pid from the `NSpid:` line of a status file.
pub fn parse_nspid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .and_then(|ids| ids.split_whitespace().last())
        .and_then(|id| id.parse().ok())
}

fn join(pid: i32, ns: &'static str, flags: CloneFlags) -> Result<()> {
    let path = format!("/proc/{}/ns/{}", pid, ns);
    let fd = File::open(&path).proc_path(path)?;
    setns(fd.as_raw_fd(), flags).map_err(|source| CoreError::Namespace { ns, pid, source })
}

/// Moves this process into the target's namespaces and returns the pid the
/// target has there.
///
/// Joining a pid namespace only applies to children, so in that case we fork:
/// the parent waits for the child and exits with its status, and only the
/// child returns from here. Must run before any other thread is started.
pub fn enter_target_namespaces(pid: i32) -> Result<i32> {
    let mut target = pid;

    if differs(pid, "pid")? {
        let path = format!("/proc/{}/status", pid);
        let status = std::fs::read_to_string(&path).proc_path(path)?;
        target = parse_nspid(&status).ok_or(CoreError::NamespacePid(pid))?;
        info!("Process {} is {} in its pid namespace", pid, target);

        join(pid, "pid", CloneFlags::CLONE_NEWPID)?;

        // SAFETY: no threads have been started yet, so the child is a full copy.
        match unsafe { fork() }.map_err(std::io::Error::from)? {
            ForkResult::Parent { child } => {
                let code = match waitpid(child, None).map_err(std::io::Error::from)? {
                    WaitStatus::Exited(_, code) => code,
                    WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
                    _ => 1,
                };
                std::process::exit(code);
            }
            ForkResult::Child => debug!("Forked into pid namespace of {}", pid),
        }
    }

    if differs(pid, "mnt")? {
        join(pid, "mnt", CloneFlags::CLONE_NEWNS)?;
        debug!("Joined mount namespace of {}", pid);
    }

    Ok(target)
}
