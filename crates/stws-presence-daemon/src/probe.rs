//! Detect a running StellwerkSim communicator process
//!
//! The communicator is launched through Java Web Start, so the process is a
//! `jp2launcher` whose `-vma` argument carries the base64-encoded JVM
//! arguments, NUL-separated. The simulator's launcher is recognised by the
//! `-Djnlp.webserver=www.stellwerksim.de` entry inside that payload.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, trace};

const LAUNCHER_NAME: &str = "jp2launcher";
const VMA_FLAG: &str = "-vma";
const WEBSERVER_ARG: &[u8] = b"-Djnlp.webserver=www.stellwerksim.de";

/// Scans the process table for the communicator
#[derive(Debug)]
pub struct CommunicatorProbe {
    proc_root: PathBuf,
    /// Pid of the last match, accepted again without decoding its arguments
    known_pid: Option<u32>,
}

impl Default for CommunicatorProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicatorProbe {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            known_pid: None,
        }
    }

    /// Whether a communicator launcher is currently running
    ///
    /// Processes that vanish or deny access mid-scan are skipped.
    pub fn is_running(&mut self) -> bool {
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, root = %self.proc_root.display(), "Cannot scan process table");
                return false;
            }
        };

        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let dir = entry.path();

            match read_comm(&dir) {
                Some(comm) if comm.starts_with(LAUNCHER_NAME) => {}
                _ => continue,
            }

            if self.known_pid == Some(pid) {
                return true;
            }

            let Some(args) = read_cmdline(&dir) else {
                continue;
            };
            if is_communicator_cmdline(&args) {
                debug!(pid, "Found communicator process");
                self.known_pid = Some(pid);
                return true;
            }
        }

        trace!("No communicator process found");
        false
    }
}

fn read_comm(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("comm"))
        .ok()
        .map(|s| s.trim_end().to_string())
}

fn read_cmdline(dir: &Path) -> Option<Vec<String>> {
    let raw = fs::read(dir.join("cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

/// Check a launcher's argument list for the simulator's webserver
pub fn is_communicator_cmdline<S: AsRef<str>>(args: &[S]) -> bool {
    let Some(index) = args.iter().position(|arg| arg.as_ref() == VMA_FLAG) else {
        return false;
    };
    let Some(payload) = args.get(index + 1) else {
        return false;
    };

    match STANDARD.decode(payload.as_ref().trim()) {
        Ok(decoded) => decoded.split(|b| *b == 0).any(|part| part == WEBSERVER_ARG),
        Err(e) => {
            trace!(error = %e, "Undecodable -vma payload");
            false
        }
    }
}
