//! `/proc/<pid>/stat` records.
//!
//! The record is positional: the n-th token fills the n-th field of
//! [`ProcessStat`]. Each field has its own decoder, listed in order in
//! [`STAT_SCHEMA`]. Input with fewer tokens than fields is accepted and leaves
//! the remaining fields at their defaults.

use crate::error::{CoreError, Result};

struct StatField {
    name: &'static str,
    apply: fn(&mut ProcessStat, &str) -> Result<()>,
}

macro_rules! stat_schema {
    ($($field:ident: $ty:ty = $decode:ident,)*) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct ProcessStat {
            $(pub $field: $ty,)*
        }

        const STAT_SCHEMA: &[StatField] = &[$(
            StatField {
                name: stringify!($field),
                apply: |stat, token| {
                    stat.$field = $decode(token).ok_or_else(|| CoreError::StatField {
                        field: stringify!($field),
                        token: token.to_owned(),
                    })?;
                    Ok(())
                },
            },
        )*];
    };
}

stat_schema! {
    pid: i32 = number,
    comm: String = command,
    state: u8 = state_char,
    ppid: i32 = number,
    pgrp: i32 = number,
    session: i32 = number,
    tty_nr: i32 = number,
    tpgid: i32 = number,
    flags: u32 = number,
    minflt: u64 = number,
    cminflt: u64 = number,
    majflt: u64 = number,
    cmajflt: u64 = number,
    utime: u64 = number,
    stime: u64 = number,
    cutime: i64 = number,
    cstime: i64 = number,
    priority: i64 = number,
    nice: i64 = number,
    num_threads: i64 = number,
    itrealvalue: i64 = number,
    starttime: u64 = number,
    vsize: u64 = number,
    rss: i64 = number,
    rsslim: u64 = number,
    startcode: u64 = number,
    endcode: u64 = number,
    startstack: u64 = number,
    kstkesp: u64 = number,
    kstkeip: u64 = number,
    signal: u64 = number,
    blocked: u64 = number,
    sigignore: u64 = number,
    sigcatch: u64 = number,
    wchan: u64 = number,
    nswap: u64 = number,
    cnswap: u64 = number,
    exit_signal: i32 = number,
    processor: i32 = number,
    rt_priority: u32 = number,
    policy: u32 = number,
    delayacct_blkio_ticks: u64 = number,
    guest_time: u64 = number,
    cguest_time: i64 = number,
    start_data: u64 = number,
    end_data: u64 = number,
    start_brk: u64 = number,
    arg_start: u64 = number,
    arg_end: u64 = number,
    env_start: u64 = number,
    env_end: u64 = number,
    exit_code: i32 = number,
}

fn number<T: std::str::FromStr>(token: &str) -> Option<T> {
    token.parse().ok()
}

fn state_char(token: &str) -> Option<u8> {
    token.bytes().next()
}

fn command(token: &str) -> Option<String> {
    let token = token.strip_prefix('(').unwrap_or(token);
    Some(token.strip_suffix(')').unwrap_or(token).to_owned())
}

/// Splits a stat line into positional tokens, keeping a parenthesized
/// command name whole even when it contains spaces.
fn tokenize(text: &str) -> Vec<&str> {
    let (Some(open), Some(close)) = (text.find('('), text.rfind(')')) else {
        return text.split_whitespace().collect();
    };
    if close < open {
        return text.split_whitespace().collect();
    }

    let mut tokens: Vec<&str> = text[..open].split_whitespace().collect();
    tokens.push(&text[open..=close]);
    tokens.extend(text[close + 1..].split_whitespace());
    tokens
}

pub fn parse_stat(text: &str) -> Result<ProcessStat> {
    let mut stat = ProcessStat::default();
    for (field, token) in STAT_SCHEMA.iter().zip(tokenize(text)) {
        log::trace!("stat {} = {}", field.name, token);
        (field.apply)(&mut stat, token)?;
    }
    Ok(stat)
}
