use goblin::elf::header::ET_CORE;
use goblin::elf::program_header::{PT_LOAD, PT_NOTE};
use goblin::elf::Elf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

fn count_regions(pid: u32) -> usize {
    let smaps = std::fs::read_to_string(format!("/proc/{}/smaps", pid)).unwrap();
    smaps
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .next()
                .map_or(false, |first| !first.ends_with(':'))
        })
        .count()
}

#[test]
#[ignore = "needs permission to ptrace a sibling process"]
fn dumps_sleeping_child() {
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    thread::sleep(Duration::from_millis(200));
    let regions = count_regions(child.id());

    let core = tempfile::NamedTempFile::new().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_livecore"))
        .arg("-p")
        .arg(child.id().to_string())
        .arg("-o")
        .arg(core.path())
        .stdout(Stdio::null())
        .status()
        .unwrap();

    child.kill().unwrap();
    child.wait().unwrap();
    assert!(status.success());

    let bytes = std::fs::read(core.path()).unwrap();
    let elf = Elf::parse(&bytes).unwrap();
    assert_eq!(elf.header.e_type, ET_CORE);
    assert_eq!(elf.program_headers.len(), 1 + regions);
    assert_eq!(elf.program_headers[0].p_type, PT_NOTE);
    assert!(elf.program_headers[1..].iter().all(|p| p.p_type == PT_LOAD));

    let last = elf
        .program_headers
        .iter()
        .filter(|p| p.p_filesz > 0)
        .map(|p| p.p_offset + p.p_filesz)
        .max()
        .unwrap();
    assert_eq!(last, bytes.len() as u64);
}
