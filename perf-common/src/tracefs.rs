//! Tracepoint discovery through the kernel's tracing filesystem.
//!
//! Every tracepoint the kernel advertises has a directory under
//! `events/<subsystem>/<name>/` containing an `id` file (the numeric id used
//! in `perf_event_attr.config` and in the `common_type` field of raw
//! payloads) and a `format` file describing the binary layout of the
//! payload. [`TraceFormatCache`] parses those descriptors lazily and retains
//! them for the process lifetime. Kprobes and uprobes are installed by
//! appending to `kprobe_events`/`uprobe_events` and, once installed, present
//! themselves as ordinary tracepoints.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use std::collections::HashMap;

use sys_mount::{Mount, MountFlags};
use thiserror::Error;

use crate::maps::SnapshotMap;

const TRACEFS_ROOTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];
const TRACEFS: &str = "tracefs";

/// The group name used for probes this sensor installs.
pub const PROBE_GROUP: &str = "argus";

#[derive(Error, Debug)]
pub enum TracefsError {
    #[error("tracing filesystem is not mounted")]
    TraceFsAbsent,

    #[error("malformed format descriptor at line {line}: {reason}")]
    FormatParse { line: usize, reason: String },

    #[error("unknown tracepoint {subsystem}/{name}")]
    UnknownEvent { subsystem: String, name: String },

    #[error("reading {path}")]
    ReadFile {
        #[source]
        source: std::io::Error,
        path: String,
    },

    #[error("writing {path}")]
    WriteFile {
        #[source]
        source: std::io::Error,
        path: String,
    },

    #[error("mounting tracing filesystem")]
    Mount(#[source] std::io::Error),
}

fn parse_error(line: usize, reason: impl Into<String>) -> TracefsError {
    TracefsError::FormatParse {
        line,
        reason: reason.into(),
    }
}

/// One field of a tracepoint payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceField {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
    /// Fixed-size array length, e.g. `char comm[16]`.
    pub array_len: Option<usize>,
    /// `__data_loc` fields store a u32 `(len << 16) | offset` locator
    /// pointing at variable-length data elsewhere in the payload.
    pub data_loc: bool,
    /// Character arrays decode to strings rather than numeric lists.
    pub is_string: bool,
}

/// Parsed representation of a tracepoint `format` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFormat {
    pub id: u16,
    pub name: String,
    pub fields: Vec<TraceField>,
}

impl TraceFormat {
    pub fn field(&self, name: &str) -> Option<&TraceField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Total payload size implied by the field layout.
    pub fn payload_size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.size)
            .max()
            .unwrap_or(0)
    }
}

/// Parses the contents of a tracepoint `format` file.
///
/// The recognised grammar per field line is
/// `field:TYPE NAME; offset:N; size:N; signed:N;` where `TYPE` may carry an
/// `[N]` array suffix or the `__data_loc` marker.
pub fn parse_format(name: &str, contents: &str) -> Result<TraceFormat, TracefsError> {
    let mut id = None;
    let mut fields = Vec::new();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(value) = line.strip_prefix("ID:") {
            id = Some(
                value
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| parse_error(lineno + 1, "bad event id"))?,
            );
        } else if line.starts_with("field:") {
            fields.push(parse_field_line(lineno + 1, line)?);
        }
        // "name:", "print fmt:" and anything else is irrelevant here.
    }

    Ok(TraceFormat {
        id: id.ok_or_else(|| parse_error(0, "missing ID property"))?,
        name: name.to_string(),
        fields,
    })
}

fn parse_field_line(lineno: usize, line: &str) -> Result<TraceField, TracefsError> {
    let mut decl = None;
    let mut offset = None;
    let mut size = None;
    let mut signed = None;

    for part in line.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| parse_error(lineno, format!("missing ':' in {part:?}")))?;
        let value = value.trim();
        match key.trim() {
            "field" => decl = Some(value),
            "offset" => {
                offset = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| parse_error(lineno, "bad offset"))?,
                )
            }
            "size" => {
                size = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| parse_error(lineno, "bad size"))?,
                )
            }
            "signed" => {
                signed = Some(
                    value
                        .parse::<u8>()
                        .map_err(|_| parse_error(lineno, "bad signed flag"))?
                        != 0,
                )
            }
            other => return Err(parse_error(lineno, format!("unknown property {other:?}"))),
        }
    }

    let decl = decl.ok_or_else(|| parse_error(lineno, "missing field declaration"))?;
    let offset = offset.ok_or_else(|| parse_error(lineno, "missing offset"))?;
    let size = size.ok_or_else(|| parse_error(lineno, "missing size"))?;
    let signed = signed.unwrap_or(false);

    let data_loc = decl.starts_with("__data_loc");
    let name_token = decl
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .ok_or_else(|| parse_error(lineno, "missing field name"))?;

    let (name, array_len) = match name_token.split_once('[') {
        Some((name, rest)) => {
            let len = rest
                .strip_suffix(']')
                .ok_or_else(|| parse_error(lineno, "unterminated array suffix"))?;
            if len.is_empty() {
                // `TYPE NAME[]` only shows up on dynamic arrays.
                (name, None)
            } else {
                let len = len
                    .parse::<usize>()
                    .map_err(|_| parse_error(lineno, "bad array length"))?;
                (name, Some(len))
            }
        }
        None => (name_token, None),
    };

    Ok(TraceField {
        name: name.to_string(),
        offset,
        size,
        signed,
        array_len: if data_loc { None } else { array_len },
        data_loc,
        is_string: decl.contains("char") && (data_loc || array_len.is_some()),
    })
}

/// Lazily parsed, process-lifetime cache of tracepoint formats.
pub struct TraceFormatCache {
    root: PathBuf,
    by_id: SnapshotMap<u16, Arc<TraceFormat>>,
    by_name: Mutex<HashMap<String, u16>>,
}

impl TraceFormatCache {
    /// Uses the mounted tracing filesystem, preferring the tracefs location
    /// over the legacy debugfs one.
    pub fn from_mounted() -> Result<Self, TracefsError> {
        let root = tracing_root().ok_or(TracefsError::TraceFsAbsent)?;
        Ok(Self::with_root(root))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root,
            by_id: SnapshotMap::new(),
            by_name: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `subsystem/name` to its numeric id and parsed format,
    /// reading the descriptor files on first use.
    pub fn resolve(
        &self,
        subsystem: &str,
        name: &str,
    ) -> Result<(u16, Arc<TraceFormat>), TracefsError> {
        let key = format!("{subsystem}/{name}");
        if let Some(id) = self.by_name.lock().unwrap().get(&key) {
            if let Some(format) = self.by_id.lookup(id) {
                return Ok((*id, format));
            }
        }

        let event_dir = self.root.join("events").join(subsystem).join(name);
        if !event_dir.is_dir() {
            return Err(TracefsError::UnknownEvent {
                subsystem: subsystem.to_string(),
                name: name.to_string(),
            });
        }

        let id: u16 = read_file(&event_dir.join("id"))?
            .trim()
            .parse()
            .map_err(|_| parse_error(1, "bad id file"))?;
        let contents = read_file(&event_dir.join("format"))?;
        let mut format = parse_format(&key, &contents)?;
        // The sibling id file is authoritative.
        format.id = id;

        let format = Arc::new(format);
        self.by_id.insert(id, Arc::clone(&format));
        self.by_name.lock().unwrap().insert(key, id);
        Ok((id, format))
    }

    /// Lookup a previously resolved format by numeric id. Wait-free; used
    /// on the decode path.
    pub fn lookup(&self, id: u16) -> Option<Arc<TraceFormat>> {
        self.by_id.lookup(&id)
    }

    /// Installs a kprobe (or kretprobe) and resolves it like any other
    /// tracepoint. The probe lives in the [`PROBE_GROUP`] group.
    pub fn add_kprobe(
        &self,
        name: &str,
        symbol: &str,
        on_return: bool,
    ) -> Result<(u16, Arc<TraceFormat>), TracefsError> {
        let kind = if on_return { 'r' } else { 'p' };
        self.append_probe_line(
            "kprobe_events",
            &format!("{kind}:{PROBE_GROUP}/{name} {symbol}"),
        )?;
        self.resolve(PROBE_GROUP, name)
    }

    pub fn remove_kprobe(&self, name: &str) -> Result<(), TracefsError> {
        self.append_probe_line("kprobe_events", &format!("-:{PROBE_GROUP}/{name}"))
    }

    /// Installs a uprobe on `path` at `offset`.
    pub fn add_uprobe(
        &self,
        name: &str,
        path: &str,
        offset: u64,
        on_return: bool,
    ) -> Result<(u16, Arc<TraceFormat>), TracefsError> {
        let kind = if on_return { 'r' } else { 'p' };
        self.append_probe_line(
            "uprobe_events",
            &format!("{kind}:{PROBE_GROUP}/{name} {path}:{offset:#x}"),
        )?;
        self.resolve(PROBE_GROUP, name)
    }

    pub fn remove_uprobe(&self, name: &str) -> Result<(), TracefsError> {
        self.append_probe_line("uprobe_events", &format!("-:{PROBE_GROUP}/{name}"))
    }

    fn append_probe_line(&self, file: &str, line: &str) -> Result<(), TracefsError> {
        let path = self.root.join(file);
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| TracefsError::WriteFile {
                source,
                path: path.display().to_string(),
            })?;
        writeln!(f, "{line}").map_err(|source| TracefsError::WriteFile {
            source,
            path: path.display().to_string(),
        })
    }
}

fn read_file(path: &Path) -> Result<String, TracefsError> {
    fs::read_to_string(path).map_err(|source| TracefsError::ReadFile {
        source,
        path: path.display().to_string(),
    })
}

/// Returns the root of the mounted tracing filesystem, if any.
pub fn tracing_root() -> Option<PathBuf> {
    TRACEFS_ROOTS
        .iter()
        .map(PathBuf::from)
        .find(|root| root.join("events").is_dir())
        .or_else(tracing_root_from_mountinfo)
}

/// Tracefs mounted somewhere unusual still counts; consult the mount
/// table for it.
fn tracing_root_from_mountinfo() -> Option<PathBuf> {
    let process = procfs::process::Process::myself().ok()?;
    process
        .mountinfo()
        .ok()?
        .into_iter()
        .find(|mount| mount.fs_type == TRACEFS)
        .map(|mount| mount.mount_point)
        .filter(|root| root.join("events").is_dir())
}

/// Makes sure a tracing filesystem is available, mounting tracefs when it
/// is not. With `dont_mount` set, a missing mount is reported instead.
pub fn check_or_mount_tracing(dont_mount: bool) -> Result<PathBuf, TracefsError> {
    if let Some(root) = tracing_root() {
        return Ok(root);
    }
    if dont_mount {
        return Err(TracefsError::TraceFsAbsent);
    }

    let target = Path::new(TRACEFS_ROOTS[0]);
    log::debug!("Mounting tracefs on {}", target.display());
    Mount::new(
        TRACEFS,
        target,
        sys_mount::FilesystemType::Manual(TRACEFS),
        MountFlags::empty(),
        None,
    )
    .map_err(TracefsError::Mount)?;

    tracing_root().ok_or(TracefsError::TraceFsAbsent)
}

const PERF_EVENT_CGROUP_ROOT: &str = "/sys/fs/cgroup/perf_event";

/// Makes sure the `perf_event` cgroup hierarchy is mounted; cgroup-scoped
/// subscriptions open their target directory beneath it.
pub fn check_or_mount_perf_event_cgroup(dont_mount: bool) -> Result<PathBuf, TracefsError> {
    let root = Path::new(PERF_EVENT_CGROUP_ROOT);
    if root.is_dir() {
        return Ok(root.to_path_buf());
    }
    if dont_mount {
        return Err(TracefsError::TraceFsAbsent);
    }

    log::debug!("Mounting perf_event cgroup hierarchy on {PERF_EVENT_CGROUP_ROOT}");
    std::fs::create_dir_all(root).map_err(TracefsError::Mount)?;
    Mount::new(
        "cgroup",
        root,
        sys_mount::FilesystemType::Manual("cgroup"),
        MountFlags::empty(),
        Some("perf_event"),
    )
    .map_err(TracefsError::Mount)?;
    Ok(root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Taken from sched/sched_process_exec on a 5.x kernel.
    const EXEC_FORMAT: &str = "\
name: sched_process_exec
ID: 310
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:__data_loc char[] filename;\toffset:8;\tsize:4;\tsigned:1;
\tfield:pid_t pid;\toffset:12;\tsize:4;\tsigned:1;
\tfield:pid_t old_pid;\toffset:16;\tsize:4;\tsigned:1;

print fmt: \"filename=%s pid=%d old_pid=%d\", __get_str(filename), REC->pid, REC->old_pid
";

    const FORK_FORMAT: &str = "\
name: sched_process_fork
ID: 317
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char parent_comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t parent_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:char child_comm[16];\toffset:28;\tsize:16;\tsigned:0;
\tfield:pid_t child_pid;\toffset:44;\tsize:4;\tsigned:1;

print fmt: \"comm=%s pid=%d\", REC->parent_comm, REC->parent_pid
";

    #[test]
    fn parses_exec_format() {
        let format = parse_format("sched/sched_process_exec", EXEC_FORMAT).unwrap();
        assert_eq!(format.id, 310);
        assert_eq!(format.fields.len(), 7);

        let filename = format.field("filename").unwrap();
        assert!(filename.data_loc);
        assert_eq!(filename.offset, 8);
        assert_eq!(filename.size, 4);

        let pid = format.field("pid").unwrap();
        assert!(pid.signed);
        assert_eq!(pid.offset, 12);
        assert_eq!(format.payload_size(), 20);
    }

    #[test]
    fn parses_fixed_arrays() {
        let format = parse_format("sched/sched_process_fork", FORK_FORMAT).unwrap();
        let comm = format.field("parent_comm").unwrap();
        assert_eq!(comm.array_len, Some(16));
        assert_eq!(comm.size, 16);
        assert!(!comm.signed);
        let child = format.field("child_pid").unwrap();
        assert_eq!(child.offset, 44);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let bad = "ID: 9\n\tfield:int x;\toffset:nope;\tsize:4;\tsigned:1;\n";
        match parse_format("t/bad", bad) {
            Err(TracefsError::FormatParse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_id_is_rejected() {
        assert!(parse_format("t/noid", "name: x\nformat:\n").is_err());
    }

    #[test]
    fn cache_resolves_from_directory_tree() {
        let dir = std::env::temp_dir().join(format!("argus-tracefs-{}", std::process::id()));
        let event_dir = dir.join("events/sched/sched_process_exec");
        fs::create_dir_all(&event_dir).unwrap();
        fs::write(event_dir.join("id"), "310\n").unwrap();
        fs::write(event_dir.join("format"), EXEC_FORMAT).unwrap();

        let cache = TraceFormatCache::with_root(dir.clone());
        let (id, format) = cache.resolve("sched", "sched_process_exec").unwrap();
        assert_eq!(id, 310);
        assert_eq!(format.fields.len(), 7);
        // Second resolve hits the cache; the lookup-by-id path sees it too.
        let (again, _) = cache.resolve("sched", "sched_process_exec").unwrap();
        assert_eq!(again, id);
        assert!(cache.lookup(310).is_some());
        assert!(matches!(
            cache.resolve("sched", "no_such_event"),
            Err(TracefsError::UnknownEvent { .. })
        ));

        fs::remove_dir_all(dir).unwrap();
    }
}
