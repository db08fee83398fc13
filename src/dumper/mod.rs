mod elfcore;
#[cfg(test)]
mod fixtures;
mod notes;
mod ptrace;
mod records;

pub use ptrace::TraceOp;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::io::Write;

use crate::error::Result;
use crate::utils::{read_smaps, ProcessMemory};
use elfcore::{load_segments, CoreImage};
use ptrace::{seize_threads, Tracer};

/// Knobs for one dump.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Draw a byte progress bar on stderr while streaming the image.
    pub progress: bool,
}

/// Puts the main thread first, keeping the remaining ids in ascending order.
fn thread_order(pid: i32, mut tids: Vec<i32>) -> Vec<i32> {
    if let Some(pos) = tids.iter().position(|&tid| tid == pid) {
        let main = tids.remove(pos);
        tids.insert(0, main);
    }
    tids
}

fn progress_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{bytes}/{total_bytes} [{wide_bar}] {bytes_per_sec} eta {eta}")
    {
        bar.set_style(style);
    }
    bar
}

/// Stops every thread of `pid` and writes its core image to `out`.
///
/// Returns the number of bytes written. Nothing detaches the threads
/// explicitly; the kernel releases them once the trace worker exits.
pub fn generate_core<W: Write>(pid: i32, out: &mut W, options: &DumpOptions) -> Result<u64> {
    let tracer = Tracer::spawn()?;
    let tids = thread_order(pid, seize_threads(&tracer, pid)?);
    info!("Seized {} threads of process {}", tids.len(), pid);

    let regions = read_smaps(pid)?;
    let dumpable: u64 = regions.iter().filter(|r| r.is_dumpable()).map(|r| r.len()).sum();
    debug!("Process {} maps {} regions, {:#x} dumpable bytes", pid, regions.len(), dumpable);

    let notes = notes::build_notes(&tracer, pid, &tids, &regions)?;

    let memory = ProcessMemory::open(pid)?;
    let image = CoreImage::new(notes, load_segments(&regions, &memory))?;

    let bar = progress_bar(image.size(), options.progress);
    let written = image.write(&mut bar.wrap_write(&mut *out))?;
    bar.finish_and_clear();

    info!("Wrote {} bytes of core for process {}", written, pid);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn main_thread_goes_first() {
        assert_eq!(thread_order(30, vec![10, 20, 30, 40]), vec![30, 10, 20, 40]);
        assert_eq!(thread_order(10, vec![10, 20]), vec![10, 20]);
        assert_eq!(thread_order(5, vec![10, 20]), vec![10, 20]);
    }

    #[test]
    fn hidden_bar_by_default() {
        assert!(progress_bar(100, false).is_hidden());
    }
}
