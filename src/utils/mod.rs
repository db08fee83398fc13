pub mod namespace;
mod process;
mod smaps;
mod stat;
mod types;

pub use process::{
    get_pid_by_name, list_tasks, process_owner, read_auxv, read_cmdline, read_smaps, read_stat,
    ProcessMemory,
};
pub use stat::ProcessStat;
pub use types::{MemoryRegion, Perms};
