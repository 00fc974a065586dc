//! Utility functions used to extract process data from procfs.
//!
//! The `stat` parser is careful about the command field: the kernel prints
//! it between parentheses but does not escape anything, so the command
//! itself may contain spaces and parentheses. Everything before the first
//! `(` is the pid and everything after the last `)` is a well-formed field
//! list.

use std::{fs, io};

use glob::glob;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("malformed {what} for process {pid}")]
    Malformed { what: &'static str, pid: i32 },

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// A parsed `/proc/PID/stat` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: i32,
    pub comm: String,
    /// Fields from `state` (field 3) onwards, in order.
    rest: Vec<String>,
}

impl ProcessStat {
    pub fn parse(line: &str) -> Result<Self, ProcfsError> {
        let line = line.trim_end();
        let malformed = |what| ProcfsError::Malformed { what, pid: 0 };

        let open = line.find('(').ok_or_else(|| malformed("stat"))?;
        let close = line.rfind(')').ok_or_else(|| malformed("stat"))?;
        if close < open {
            return Err(malformed("stat"));
        }
        let pid: i32 = line[..open].trim().parse()?;
        let comm = line[open + 1..close].to_string();
        let rest: Vec<String> = line[close + 1..]
            .split_ascii_whitespace()
            .map(str::to_string)
            .collect();
        if rest.len() < 26 {
            return Err(ProcfsError::Malformed { what: "stat", pid });
        }
        Ok(Self { pid, comm, rest })
    }

    /// Field numbers follow proc(5), where pid is field 1.
    fn field(&self, number: usize) -> &str {
        &self.rest[number - 3]
    }

    pub fn state(&self) -> &str {
        self.field(3)
    }

    pub fn ppid(&self) -> i32 {
        self.field(4).parse().unwrap_or(0)
    }

    /// Process start time, in clock ticks since boot (field 22).
    pub fn start_time(&self) -> u64 {
        self.field(22).parse().unwrap_or(0)
    }

    /// Bottom of the main thread's stack (field 28).
    pub fn start_stack(&self) -> u64 {
        self.field(28).parse().unwrap_or(0)
    }
}

/// Fields of `/proc/PID/status` the sensor cares about. The parser binds
/// line tags to struct fields through an explicit match, one arm per tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: i32,
    pub tgid: i32,
    pub ppid: i32,
    pub tracer_pid: i32,
    /// Real, effective, saved and filesystem uid.
    pub uid: [u32; 4],
    pub gid: [u32; 4],
}

impl ProcessStatus {
    pub fn parse(contents: &str) -> Result<Self, ProcfsError> {
        let mut status = Self::default();
        for line in contents.lines() {
            let Some((tag, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match tag {
                "Name" => status.name = value.to_string(),
                "Pid" => status.pid = value.parse()?,
                "Tgid" => status.tgid = value.parse()?,
                "PPid" => status.ppid = value.parse()?,
                "TracerPid" => status.tracer_pid = value.parse()?,
                "Uid" => status.uid = parse_id_quad(value)?,
                "Gid" => status.gid = parse_id_quad(value)?,
                _ => {}
            }
        }
        Ok(status)
    }
}

fn parse_id_quad(value: &str) -> Result<[u32; 4], ProcfsError> {
    let mut ids = [0u32; 4];
    let mut parts = value.split_ascii_whitespace();
    for id in ids.iter_mut() {
        *id = parts
            .next()
            .ok_or(ProcfsError::Malformed {
                what: "status id quad",
                pid: 0,
            })?
            .parse()?;
    }
    Ok(ids)
}

/// One line of `/proc/PID/cgroup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupEntry {
    pub hierarchy: u32,
    pub controllers: Vec<String>,
    pub path: String,
}

pub fn parse_cgroups(contents: &str) -> Vec<CgroupEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let hierarchy = parts.next()?.parse().ok()?;
            let controllers = parts
                .next()?
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            let path = parts.next()?.to_string();
            Some(CgroupEntry {
                hierarchy,
                controllers,
                path,
            })
        })
        .collect()
}

/// Recovers a container id from a process's cgroup paths.
///
/// Recognised forms: plain container-engine paths (`/docker/<id>`,
/// `/kubepods/.../<id>`) and systemd scopes
/// (`/system.slice/docker-<id>.scope`). Anything whose final path segment
/// does not reduce to a 64-digit hex id (e.g. `user.slice`) yields `None`.
pub fn container_id_from_cgroups(entries: &[CgroupEntry]) -> Option<String> {
    for entry in entries {
        let segment = entry.path.rsplit('/').next().unwrap_or("");
        let candidate = segment
            .strip_prefix("docker-")
            .and_then(|s| s.strip_suffix(".scope"))
            .unwrap_or(segment);
        if candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(candidate.to_string());
        }
    }
    None
}

fn read_proc_file(pid: Pid, name: &str) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/{name}");
    fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })
}

pub fn stat(pid: Pid) -> Result<ProcessStat, ProcfsError> {
    ProcessStat::parse(&read_proc_file(pid, "stat")?)
}

pub fn status(pid: Pid) -> Result<ProcessStatus, ProcfsError> {
    ProcessStatus::parse(&read_proc_file(pid, "status")?)
}

pub fn cgroups(pid: Pid) -> Result<Vec<CgroupEntry>, ProcfsError> {
    Ok(parse_cgroups(&read_proc_file(pid, "cgroup")?))
}

/// The container id of a process, or `None` for host processes.
pub fn container_id(pid: Pid) -> Result<Option<String>, ProcfsError> {
    Ok(container_id_from_cgroups(&cgroups(pid)?))
}

/// The cgroup path of a process on the `perf_event` hierarchy (falling
/// back to the v2 unified hierarchy).
pub fn perf_event_cgroup_path(pid: Pid) -> Result<Option<String>, ProcfsError> {
    let entries = cgroups(pid)?;
    Ok(entries
        .iter()
        .find(|e| e.controllers.iter().any(|c| c == "perf_event"))
        .or_else(|| entries.iter().find(|e| e.hierarchy == 0))
        .map(|e| e.path.clone()))
}

/// Returns the command line of a process, NUL-split.
pub fn command_line(pid: Pid) -> Result<Vec<String>, ProcfsError> {
    Ok(read_proc_file(pid, "cmdline")?
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Literal /proc/PID/stat lines, parens and spaces included.
    const STAT_CASES: &[(&str, i32, &str, i32, u64, u64)] = &[
        (
            "4018 (bash) S 4011 4018 4018 34834 7516 4194304 8082 41779 1 85 33 7 115 329 20 0 1 0 8810 24444928 1667 18446744073709551615 4194304 5192876 140734725904528 140734725903192 140515966087290 0 65536 3670020 1266777851 1 0 0 17 3 0 0 1 0 0 7290352 7326856 31535104 140734725912793 140734725912798 140734725912798 140734725914606 0\n",
            4018,
            "bash",
            4011,
            8810,
            140734725904528,
        ),
        (
            "899 (rs:main Q:Reg) S 1 828 828 0 -1 1077936192 720 0 5 0 374 450 0 0 20 0 4 0 512 262553600 2530 18446744073709551615 1 1 0 0 0 0 2146172671 16781830 1132545 0 0 0 -1 1 0 0 9 0 0 0 0 0 0 0 0 0 0\n",
            899,
            "rs:main Q:Reg",
            1,
            512,
            0,
        ),
        (
            "25663 (a b) S 4090 25663 4090 34833 25831 4194304 112 0 0 0 0 0 0 0 20 0 1 0 2591294 4616192 191 18446744073709551615 93931362930688 93931363074588 140721799437360 140721799436056 139765395259690 0 0 0 65538 1 0 0 17 0 0 0 0 0 0 93931365175144 93931365179936 93931378774016 140721799438724 140721799438752 140721799438752 140721799442404 0\n",
            25663,
            "a b",
            4090,
            2591294,
            140721799437360,
        ),
        (
            "25666 ((c) S 4090 25666 4090 34833 25831 4194304 111 0 0 0 0 0 0 0 20 0 1 0 2591294 4616192 197 18446744073709551615 94586441084928 94586441228828 140737160769408 140737160768104 140708343980330 0 0 0 65538 1 0 0 17 3 0 0 0 0 0 94586443329384 94586443334176 94586462375936 140737160774023 140737160774050 140737160774050 140737160777701 0\n",
            25666,
            "(c",
            4090,
            2591294,
            140737160769408,
        ),
        (
            "25669 (d)) S 4090 25669 4090 34833 25831 4194304 114 0 0 0 0 0 0 0 20 0 1 0 2591295 4616192 201 18446744073709551615 93918460887040 93918461030940 140727364187808 140727364186504 140658074984746 0 0 0 65538 1 0 0 17 3 0 0 0 0 0 93918463131496 93918463136288 93918473555968 140727364190599 140727364190626 140727364190626 140727364194277 0\n",
            25669,
            "d)",
            4090,
            2591295,
            140727364187808,
        ),
        (
            "25672 (((e))) S 4090 25672 4090 34833 25831 4194304 114 0 0 0 0 0 0 0 20 0 1 0 2591295 4616192 178 18446744073709551615 94113212719104 94113212863004 140724070346384 140724070345080 140031172235562 0 0 0 65538 1 0 0 17 0 0 0 0 0 0 94113214963560 94113214968352 94113226104832 140724070355326 140724070355356 140724070355356 140724070359010 0\n",
            25672,
            "((e))",
            4090,
            2591295,
            140724070346384,
        ),
        (
            "25675 ( f  ) S 4090 25675 4090 34833 25831 4194304 111 0 0 0 0 0 0 0 20 0 1 0 2591295 4616192 191 18446744073709551615 94829034725376 94829034869276 140737237421792 140737237420488 139937926709546 0 0 0 65538 1 0 0 17 2 0 0 0 0 0 94829036969832 94829036974624 94829068091392 140737237426561 140737237426590 140737237426590 140737237430243 0\n",
            25675,
            " f  ",
            4090,
            2591295,
            140737237421792,
        ),
    ];

    #[test]
    fn parses_stat_lines() {
        for &(line, pid, comm, ppid, start_time, start_stack) in STAT_CASES {
            let stat = ProcessStat::parse(line).unwrap();
            assert_eq!(stat.pid, pid, "{line:?}");
            assert_eq!(stat.comm, comm, "{line:?}");
            assert_eq!(stat.ppid(), ppid, "{line:?}");
            assert_eq!(stat.start_time(), start_time, "{line:?}");
            assert_eq!(stat.start_stack(), start_stack, "{line:?}");
            assert_eq!(stat.state(), "S");
        }
    }

    #[test]
    fn rejects_garbage_stat() {
        assert!(ProcessStat::parse("not a stat line").is_err());
        assert!(ProcessStat::parse("123 (short) S 1").is_err());
    }

    #[test]
    fn parses_status_blob() {
        let blob = "Name:\tvmhgfs-fuse\n\
                    State:\tS (sleeping)\n\
                    Tgid:\t426\n\
                    Ngid:\t0\n\
                    Pid:\t116220\n\
                    PPid:\t1\n\
                    TracerPid:\t0\n\
                    Uid:\t1000\t1000\t1000\t1000\n\
                    Gid:\t1000\t1000\t1000\t1000\n\
                    FDSize:\t64\n\
                    VmPeak:\t 2167408 kB\n";
        let status = ProcessStatus::parse(blob).unwrap();
        assert_eq!(status.name, "vmhgfs-fuse");
        assert_eq!(status.pid, 116220);
        assert_eq!(status.tgid, 426);
        assert_eq!(status.ppid, 1);
        assert_eq!(status.uid, [1000, 1000, 1000, 1000]);
        assert_eq!(status.gid, [1000, 1000, 1000, 1000]);
    }

    #[test]
    fn parses_init_status() {
        let blob = "Name:\tsystemd\nTgid:\t1\nPid:\t1\nPPid:\t0\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\n";
        let status = ProcessStatus::parse(blob).unwrap();
        assert_eq!(status.name, "systemd");
        assert_eq!(status.pid, 1);
        assert_eq!(status.uid, [0, 0, 0, 0]);
    }

    const DOCKER_CGROUPS: &str = "\
13:pids:/docker/e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4
10:perf_event:/docker/e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4
2:cpuset:/docker/e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4
1:name=openrc:/docker
0::/docker
";

    const SYSTEMD_SCOPE_CGROUPS: &str = "\
10:hugetlb:/system.slice/docker-47490dda5cd7e409e7bf04a8b291f87f15031090a955dac9ceed6a2160474d81.scope
9:perf_event:/system.slice/docker-47490dda5cd7e409e7bf04a8b291f87f15031090a955dac9ceed6a2160474d81.scope
1:name=systemd:/system.slice/docker-47490dda5cd7e409e7bf04a8b291f87f15031090a955dac9ceed6a2160474d81.scope
";

    const KUBEPODS_CGROUPS: &str = "\
11:hugetlb:/kubepods/besteffort/poddbcfa688-dad5-11e7-a0e9-02e725baeeac/22d8b77a1a9a6217710e3f2808c69263c674f31aa615484f808831203111e622
4:perf_event:/kubepods/besteffort/poddbcfa688-dad5-11e7-a0e9-02e725baeeac/22d8b77a1a9a6217710e3f2808c69263c674f31aa615484f808831203111e622
";

    const HOST_CGROUPS: &str = "\
9:net_cls:/
8:devices:/user.slice
7:cpu,cpuacct:/user.slice
6:pids:/user.slice/user-1000.slice/session-5.scope
1:name=systemd:/user.slice/user-1000.slice/session-5.scope
0::/user.slice/user-1000.slice/session-5.scope
";

    #[test]
    fn extracts_container_ids() {
        let cases = [
            (
                DOCKER_CGROUPS,
                Some("e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4"),
            ),
            (
                SYSTEMD_SCOPE_CGROUPS,
                Some("47490dda5cd7e409e7bf04a8b291f87f15031090a955dac9ceed6a2160474d81"),
            ),
            (
                KUBEPODS_CGROUPS,
                Some("22d8b77a1a9a6217710e3f2808c69263c674f31aa615484f808831203111e622"),
            ),
            (HOST_CGROUPS, None),
        ];
        for (contents, expected) in cases {
            let entries = parse_cgroups(contents);
            assert_eq!(
                container_id_from_cgroups(&entries).as_deref(),
                expected,
                "{contents:?}"
            );
        }
    }

    #[test]
    fn cgroup_lines_parse_structurally() {
        let entries = parse_cgroups(HOST_CGROUPS);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].hierarchy, 9);
        assert_eq!(entries[0].controllers, vec!["net_cls"]);
        assert_eq!(entries[0].path, "/");
        assert_eq!(entries[2].controllers, vec!["cpu", "cpuacct"]);
        // The v2 entry has no controllers.
        assert!(entries[5].controllers.is_empty());
    }

    #[test]
    fn finds_perf_event_cgroup_entry() {
        let entries = parse_cgroups(DOCKER_CGROUPS);
        let path = entries
            .iter()
            .find(|e| e.controllers.iter().any(|c| c == "perf_event"))
            .map(|e| e.path.clone());
        assert_eq!(
            path.as_deref(),
            Some("/docker/e871ee9a818bab3222c94efe196e8555cb372676e96fea847a609c2d39e187a4")
        );
    }
}
