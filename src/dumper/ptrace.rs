use crossbeam_channel::{bounded, Sender};
use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::fmt;
use std::thread::{self, JoinHandle};

use crate::error::{CoreError, Result};
use crate::utils::list_tasks;

/// The ptrace requests the dumper issues, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Seize,
    Interrupt,
    Wait,
    GetRegs,
    GetFpRegs,
    GetRegSet,
    PeekSigInfo,
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceOp::Seize => "PTRACE_SEIZE",
            TraceOp::Interrupt => "PTRACE_INTERRUPT",
            TraceOp::Wait => "waitpid",
            TraceOp::GetRegs => "PTRACE_GETREGS",
            TraceOp::GetFpRegs => "PTRACE_GETFPREGS",
            TraceOp::GetRegSet => "PTRACE_GETREGSET",
            TraceOp::PeekSigInfo => "PTRACE_PEEKSIGINFO",
        };
        f.write_str(name)
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Owner of every ptrace call for one run.
///
/// The kernel only accepts ptrace requests for a tracee from the thread that
/// attached it, so all requests go through one dedicated OS thread. Callers
/// hand it a closure over a zero-capacity channel and block on the reply.
pub struct Tracer {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Tracer {
    pub fn spawn() -> Result<Self> {
        let (jobs, queue) = bounded::<Job>(0);
        let worker = thread::Builder::new()
            .name("ptrace".into())
            .spawn(move || {
                for job in queue {
                    job();
                }
            })?;

        Ok(Tracer {
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Runs `request` on the trace thread and waits for its result.
    pub fn run<T, F>(&self, op: TraceOp, tid: i32, request: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> nix::Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = reply_tx.send(request());
        });

        let jobs = self.jobs.as_ref().ok_or(CoreError::TracerGone)?;
        jobs.send(job).map_err(|_| CoreError::TracerGone)?;
        reply_rx
            .recv()
            .map_err(|_| CoreError::TracerGone)?
            .map_err(|source| CoreError::Trace { op, tid, source })
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Blocks until a freshly interrupted thread reports its stop.
fn wait_for_stop(tid: Pid) -> nix::Result<()> {
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Err(Errno::ESRCH),
            Ok(status) => {
                debug!("Thread {} stopped: {:?}", tid, status);
                return Ok(());
            }
        }
    }
}

/// Seizes and stops every thread of `pid`, rescanning the task list until a
/// full pass finds nobody new. Returns the thread ids in ascending order.
///
/// Threads stay stopped afterwards; nothing here detaches them.
pub fn seize_threads(tracer: &Tracer, pid: i32) -> Result<Vec<i32>> {
    let mut seized = BTreeSet::new();

    for round in 1.. {
        let mut attached = 0usize;

        for tid in list_tasks(pid)? {
            if seized.contains(&tid) {
                continue;
            }

            let target = Pid::from_raw(tid);
            tracer.run(TraceOp::Seize, tid, move || ptrace::seize(target, Options::empty()))?;
            tracer.run(TraceOp::Interrupt, tid, move || ptrace::interrupt(target))?;
            tracer.run(TraceOp::Wait, tid, move || wait_for_stop(target))?;

            seized.insert(tid);
            attached += 1;
        }

        debug!("Seize round {}: {} new threads", round, attached);
        if attached == 0 {
            break;
        }
    }

    Ok(seized.into_iter().collect())
}
