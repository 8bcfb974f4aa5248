use std::{fs, path::Path, sync::OnceLock};

use nix::unistd::{SysconfVar, sysconf};

/// Resource usage of a process tree at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_ms: u64,
    pub memory_kb: u64,
}

impl Usage {
    /// Component-wise maximum, used to keep peaks across samples.
    pub fn max(self, other: Usage) -> Usage {
        Usage {
            cpu_ms: self.cpu_ms.max(other.cpu_ms),
            memory_kb: self.memory_kb.max(other.memory_kb),
        }
    }
}

/// The processes that make up one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tree {
    /// Every process in a process group.
    Group(i32),
    /// Every process whose real uid is the box's. Children that left the
    /// group with `setsid` are still members.
    Owner(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    state: char,
    pgrp: i32,
    cpu_ticks: u64,
    rss_pages: u64,
}

fn clock_ticks() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| {
        sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(100)
    })
}

fn page_kb() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|v| *v > 0)
            .map(|v| v as u64 / 1024)
            .unwrap_or(4)
    })
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(line: &str) -> Option<StatFields> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) of proc(5).
    let num = |idx: usize| fields.get(idx).and_then(|v| v.parse::<u64>().ok());
    let state = fields.first()?.chars().next()?;
    let pgrp = fields.get(2)?.parse::<i32>().ok()?;
    let utime = num(11)?;
    let stime = num(12)?;
    let cutime = num(13).unwrap_or(0);
    let cstime = num(14).unwrap_or(0);
    let rss_pages = num(21).unwrap_or(0);
    Some(StatFields {
        state,
        pgrp,
        cpu_ticks: utime + stime + cutime + cstime,
        rss_pages,
    })
}

/// Real uid from the `Uid:` line of `/proc/<pid>/status`.
fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Visits every process in `tree` with its parsed stat line.
fn for_each_member(tree: Tree, mut visit: impl FnMut(i32, StatFields)) {
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let dir = entry.path();
        if let Tree::Owner(uid) = tree
            && read_uid(&dir) != Some(uid)
        {
            continue;
        }
        let Some(fields) = fs::read_to_string(dir.join("stat"))
            .ok()
            .as_deref()
            .and_then(parse_stat)
        else {
            continue;
        };
        match tree {
            Tree::Group(pgid) if fields.pgrp != pgid => continue,
            _ => visit(pid, fields),
        }
    }
}

fn read_uid(dir: &Path) -> Option<u32> {
    parse_status_uid(&fs::read_to_string(dir.join("status")).ok()?)
}

/// Sums cpu time and resident memory over every live process in `tree`.
pub fn tree_usage(tree: Tree) -> Usage {
    let mut ticks = 0u64;
    let mut pages = 0u64;
    for_each_member(tree, |_, fields| {
        ticks += fields.cpu_ticks;
        pages += fields.rss_pages;
    });
    Usage {
        cpu_ms: ticks * 1000 / clock_ticks(),
        memory_kb: pages * page_kb(),
    }
}

/// Pids in `tree` that have not exited yet. Zombies are left to their reaper.
pub fn live_pids(tree: Tree) -> Vec<i32> {
    let mut pids = Vec::new();
    for_each_member(tree, |pid, fields| {
        if !matches!(fields.state, 'Z' | 'X') {
            pids.push(pid);
        }
    });
    pids
}
