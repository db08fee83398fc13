//! Child processes for tests that trace a real target.
//!
//! Children are descendants of the test process, so they can be seized even
//! under Yama's `ptrace_scope = 1`.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const PARKED_THREADS_VAR: &str = "LIVECORE_PARKED_THREADS";

/// A spawned target, killed and reaped on drop.
pub struct Tracee {
    child: Child,
}

impl Tracee {
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// A single threaded `sleep`, returned once it runs the `sleep` image.
    pub fn sleeping() -> Self {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let tracee = Tracee { child };

        let comm = format!("/proc/{}/comm", tracee.pid());
        let deadline = Instant::now() + Duration::from_secs(10);
        while std::fs::read_to_string(&comm).unwrap().trim() != "sleep" {
            assert!(Instant::now() < deadline, "sleep child never exec'd");
            thread::sleep(Duration::from_millis(10));
        }
        tracee
    }

    /// A copy of this test binary running only [`parked_threads`], which
    /// starts `extra` sleeping threads and reports back once they exist.
    pub fn threaded(extra: usize) -> Self {
        let child = Command::new(std::env::current_exe().unwrap())
            .args([
                "-q",
                "--ignored",
                "--exact",
                "--nocapture",
                "--test-threads=1",
                "dumper::fixtures::parked_threads",
            ])
            .env(PARKED_THREADS_VAR, extra.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let mut tracee = Tracee { child };

        let stdout = tracee.child.stdout.take().unwrap();
        let ready = BufReader::new(stdout)
            .lines()
            .map_while(|line| line.ok())
            .any(|line| line.trim() == "ready");
        assert!(ready, "threaded child exited before parking its threads");
        tracee
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
#[ignore = "runs only inside a child spawned by Tracee::threaded"]
fn parked_threads() {
    let Ok(extra) = std::env::var(PARKED_THREADS_VAR) else {
        return;
    };
    for _ in 0..extra.parse::<usize>().unwrap() {
        thread::spawn(|| thread::sleep(Duration::from_secs(60)));
    }
    println!("ready");
    thread::sleep(Duration::from_secs(60));
}
