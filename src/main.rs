mod dumper;
mod error;
mod utils;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("livecore only writes x86_64 core images");

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use dumper::{generate_core, DumpOptions};
use utils::{get_pid_by_name, namespace};

#[derive(Parser, Debug)]
#[command(name = "livecore")]
#[command(about = "Write an ELF core image of a running process")]
#[command(version)]
struct Args {
    /// Target process id
    #[arg(conflicts_with_all = ["attach_pid", "attach_name"])]
    pid: Option<i32>,

    /// Target process id, same as the positional PID
    #[arg(short = 'p', long, conflicts_with = "attach_name")]
    attach_pid: Option<i32>,

    /// Pick the first process whose cmdline mentions NAME
    #[arg(short = 'n', long)]
    attach_name: Option<String>,

    /// Core file to write, stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show a progress bar on stderr
    #[arg(long)]
    progress: bool,

    /// Stay in our own pid and mount namespaces
    #[arg(long)]
    no_enter_namespaces: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut pid = if let Some(pid) = args.pid.or(args.attach_pid) {
        pid
    } else {
        let name = args
            .attach_name
            .as_deref()
            .ok_or_else(|| anyhow!("Need a pid, --attach-pid or --attach-name"))?;
        get_pid_by_name(name)?
    };

    // Opened first so the path resolves in our own mount namespace.
    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);

    if !args.no_enter_namespaces {
        pid = namespace::enter_target_namespaces(pid)
            .with_context(|| format!("Failed to enter namespaces of process {}", pid))?;
    }

    let options = DumpOptions {
        progress: args.progress,
    };
    let written = generate_core(pid, &mut out, &options)
        .with_context(|| format!("Failed to dump process {}", pid))?;
    out.flush().context("Failed to flush core image")?;

    info!("Core of process {} done, {} bytes", pid, written);
    Ok(())
}
