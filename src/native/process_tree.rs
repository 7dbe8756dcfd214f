//! Tracks every process that descends from a sandboxed step.
//!
//! Membership is the step's process group plus anything whose parent chain leads
//! back to a known member, so `setsid` or `setpgid` in the child does not hide a
//! process. Members are remembered by `(pid, start time)` once seen, which keeps
//! orphans reparented to init tracked and protects against pid reuse.
//!
//! A supervised tree runs the program behind two relay processes (see
//! `namespace`). They are killed with the tree but their memory and CPU, which
//! is mostly shared with the engine, is not charged to the step.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub state: char,
    pub cpu_ticks: u64,
    pub start_time: u64,
    pub rss_pages: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and parentheses,
/// so fields are located relative to the last `)`.
pub fn parse_stat(line: &str) -> Option<ProcStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid = line[..open].trim().parse().ok()?;
    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();

    // fields[0] is field 3 of proc(5)
    let field = |n: usize| fields.get(n - 3).copied();
    let number = |n: usize| field(n).and_then(|f| f.parse::<u64>().ok());

    Some(ProcStat {
        pid,
        state: field(3)?.chars().next()?,
        ppid: field(4)?.parse().ok()?,
        pgrp: field(5)?.parse().ok()?,
        cpu_ticks: number(14)? + number(15)?,
        start_time: number(22)?,
        rss_pages: number(24)?,
    })
}

fn read_stat(pid: i32) -> Option<ProcStat> {
    let line = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&line)
}

fn snapshot() -> io::Result<Vec<ProcStat>> {
    let mut stats = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // processes exit between listing and reading; that is not an error
        if let Some(stat) = read_stat(pid) {
            stats.push(stat);
        }
    }
    Ok(stats)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeUsage {
    pub rss_bytes: u64,
    pub cpu_ms: u64,
    pub live_processes: usize,
}

#[derive(Clone, Copy, Debug)]
struct Member {
    start_time: u64,
    cpu_ms: u64,
}

#[derive(Debug)]
pub struct ProcessTree {
    leader: i32,
    members: HashMap<i32, Member>,
    page_size: u64,
    ticks_per_second: u64,
    supervised: bool,
    terminated: bool,
}

impl ProcessTree {
    /// `leader` must be the pid of a child spawned into its own process group.
    pub fn new(leader: i32) -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            leader,
            members: HashMap::new(),
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            ticks_per_second: if ticks > 0 { ticks as u64 } else { 100 },
            supervised: false,
            terminated: false,
        }
    }

    /// `leader` is the outer relay, its only child the inner relay.
    pub fn supervised(leader: i32) -> Self {
        let mut tree = Self::new(leader);
        tree.supervised = true;
        tree
    }

    fn is_relay(&self, stat: &ProcStat) -> bool {
        self.supervised && (stat.pid == self.leader || stat.ppid == self.leader)
    }

    /// Refreshes membership and returns current memory and cumulative CPU of the tree.
    /// CPU of members that already exited stays counted.
    pub fn sample(&mut self) -> io::Result<TreeUsage> {
        let stats = snapshot()?;
        Ok(self.update(&stats))
    }

    fn update(&mut self, stats: &[ProcStat]) -> TreeUsage {
        let mut children: HashMap<i32, Vec<&ProcStat>> = HashMap::new();
        for stat in stats {
            children.entry(stat.ppid).or_default().push(stat);
        }

        let mut live: HashSet<i32> = HashSet::new();
        let mut frontier: Vec<&ProcStat> = stats
            .iter()
            .filter(|stat| {
                stat.pid == self.leader
                    || stat.pgrp == self.leader
                    || self
                        .members
                        .get(&stat.pid)
                        .is_some_and(|member| member.start_time == stat.start_time)
            })
            .collect();

        while let Some(stat) = frontier.pop() {
            if !live.insert(stat.pid) {
                continue;
            }
            if let Some(kids) = children.get(&stat.pid) {
                frontier.extend(kids.iter().copied());
            }
        }

        let mut usage = TreeUsage::default();
        for stat in stats.iter().filter(|stat| live.contains(&stat.pid)) {
            let relay = self.is_relay(stat);
            let cpu_ms = if relay {
                0
            } else {
                stat.cpu_ticks * 1000 / self.ticks_per_second
            };
            let member = self.members.entry(stat.pid).or_insert(Member {
                start_time: stat.start_time,
                cpu_ms,
            });
            if member.start_time != stat.start_time {
                // the pid was reused by a new descendant
                *member = Member {
                    start_time: stat.start_time,
                    cpu_ms,
                };
            }
            member.cpu_ms = member.cpu_ms.max(cpu_ms);
            if stat.state != 'Z' && !relay {
                usage.rss_bytes += stat.rss_pages * self.page_size;
                usage.live_processes += 1;
            }
        }
        usage.cpu_ms = self.members.values().map(|member| member.cpu_ms).sum();
        usage
    }

    /// SIGKILLs the process group and every tracked member. Repeats a few rounds so
    /// that processes forked while killing are caught as well.
    pub fn kill_all(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        for _ in 0..3 {
            // membership refresh is best-effort, the group kill below does not depend on it
            let stats = snapshot().unwrap_or_default();
            self.update(&stats);

            signal_group(self.leader)?;
            for stat in &stats {
                let tracked = self
                    .members
                    .get(&stat.pid)
                    .is_some_and(|member| member.start_time == stat.start_time);
                if tracked && stat.state != 'Z' {
                    signal_process(stat.pid)?;
                }
            }
        }
        self.terminated = true;
        Ok(())
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        if let Err(e) = self.kill_all() {
            tracing::error!("Failed to kill process tree of {}: {}", self.leader, e);
        }
    }
}

fn signal_group(pgid: i32) -> io::Result<()> {
    // SAFETY: plain syscall; a negative pid addresses the whole group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    ignore_missing(rc)
}

fn signal_process(pid: i32) -> io::Result<()> {
    // SAFETY: plain syscall on a pid verified by start time just before.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    ignore_missing(rc)
}

fn ignore_missing(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    use super::*;

    fn stat(pid: i32, ppid: i32, pgrp: i32) -> ProcStat {
        ProcStat {
            pid,
            ppid,
            pgrp,
            state: 'S',
            cpu_ticks: 10,
            start_time: pid as u64 * 100,
            rss_pages: 1,
        }
    }

    #[test]
    fn test_parse_stat_with_parens_in_name() {
        let line = "4242 (evil) (name)) S 1 4242 4242 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 98765 1000000 321 18446744073709551615";

        let stat = parse_stat(line).unwrap();

        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.cpu_ticks, 10);
        assert_eq!(stat.start_time, 98765);
        assert_eq!(stat.rss_pages, 321);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert_eq!(parse_stat("not a stat line"), None);
        assert_eq!(parse_stat("12 (x) S 1"), None);
    }

    #[test]
    fn test_update_follows_escaped_descendants() {
        let mut tree = ProcessTree::new(100);
        tree.terminated = true;

        let stats = vec![
            stat(100, 1, 100),
            // called setsid: new group, still a child
            stat(200, 100, 200),
            stat(300, 200, 200),
            stat(400, 1, 400),
        ];
        let usage = tree.update(&stats);

        assert_eq!(usage.live_processes, 3);
        assert_eq!(usage.rss_bytes, 3 * tree.page_size);
        assert!(!tree.members.contains_key(&400));

        // the leader exits and the escaped child is reparented to init
        let stats = vec![stat(200, 1, 200), stat(300, 200, 200), stat(400, 1, 400)];
        let usage = tree.update(&stats);

        assert_eq!(usage.live_processes, 2);
        // cpu of the exited leader is still counted
        assert_eq!(usage.cpu_ms, 3 * (10 * 1000 / tree.ticks_per_second));
    }

    #[test]
    fn test_supervised_tree_does_not_charge_relays() {
        let mut tree = ProcessTree::supervised(100);
        tree.terminated = true;

        let stats = vec![
            stat(100, 1, 100),
            stat(101, 100, 100),
            stat(102, 101, 100),
            stat(103, 102, 103),
        ];
        let usage = tree.update(&stats);

        assert_eq!(usage.live_processes, 2);
        assert_eq!(usage.rss_bytes, 2 * tree.page_size);
        assert_eq!(usage.cpu_ms, 2 * (10 * 1000 / tree.ticks_per_second));
        // relays are still members, so they are killed with the tree
        assert!(tree.members.contains_key(&100));
        assert!(tree.members.contains_key(&101));
    }

    #[test]
    fn test_update_ignores_reused_pid() {
        let mut tree = ProcessTree::new(100);
        tree.terminated = true;
        tree.update(&[stat(100, 1, 100), stat(200, 100, 100)]);

        let mut reused = stat(200, 1, 200);
        reused.start_time = 1;
        let usage = tree.update(&[reused]);

        assert_eq!(usage.live_processes, 0);
    }

    #[tokio::test]
    async fn test_kill_all_reaches_detached_grandchild() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("setsid sleep 30 & sleep 30")
            .process_group(0)
            .spawn()
            .unwrap();
        let leader = child.id().unwrap() as i32;
        let mut tree = ProcessTree::new(leader);

        let mut usage = TreeUsage::default();
        for _ in 0..50 {
            usage = tree.sample().unwrap();
            if usage.live_processes >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(usage.live_processes >= 2, "tree not discovered: {usage:?}");

        let tracked: Vec<i32> = tree.members.keys().copied().collect();
        tree.kill_all().unwrap();

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        tokio::time::sleep(Duration::from_millis(100)).await;
        for pid in tracked {
            if let Some(stat) = read_stat(pid) {
                assert_eq!(stat.state, 'Z', "process {pid} survived");
            }
        }
    }
}
