//! Process-tree inspection.
//!
//! Queries the OS process table in one shot, parses every row, and walks
//! the parent→children index to collect the transitive descendants of a
//! root pid. A launched command may re-parent grandchildren through an
//! intermediate wrapper, so the walk must cover the whole subtree, not just
//! direct children.
//!
//! The tree-walk is platform-independent; only the raw-row parsing varies.
//! Non-unix hosts currently report [`SupervisorError::ProcessListUnavailable`]
//! every tick, which the monitor loop absorbs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// One OS process at one poll tick. Ephemeral; recomputed every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub parent_pid: u32,
    /// Raw `ps` state column: base letter plus modifier flags.
    pub raw_state: String,
    /// Full command line as reported by the process table.
    pub command: String,
    /// Resident set size in KB.
    pub memory_kb: u64,
    pub cpu_percent: f32,
}

impl ProcessSnapshot {
    /// Executable name: the first argv word, basename only.
    pub fn program(&self) -> String {
        let first = shell_words::split(&self.command)
            .ok()
            .and_then(|argv| argv.into_iter().next())
            .unwrap_or_else(|| {
                self.command
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        first.rsplit('/').next().unwrap_or(&first).to_string()
    }
}

/// Lists all transitive descendants of `root_pid`, excluding the root
/// itself. One process-table query per call; failure or timeout yields
/// [`SupervisorError::ProcessListUnavailable`].
pub async fn list_descendants(root_pid: u32, timeout: Duration) -> Result<Vec<ProcessSnapshot>> {
    let table = query_process_table(timeout).await?;
    Ok(collect_descendants(&table, root_pid))
}

/// Walks the parent→children index breadth-first from `root_pid`.
pub fn collect_descendants(table: &[ProcessSnapshot], root_pid: u32) -> Vec<ProcessSnapshot> {
    let mut children_of: HashMap<u32, Vec<&ProcessSnapshot>> = HashMap::new();
    for row in table {
        children_of.entry(row.parent_pid).or_default().push(row);
    }

    let mut descendants = Vec::new();
    // A malformed table could contain ppid cycles; visit each pid once.
    let mut visited = HashSet::from([root_pid]);
    let mut queue = VecDeque::from([root_pid]);
    while let Some(pid) = queue.pop_front() {
        if let Some(children) = children_of.get(&pid) {
            for child in children {
                if !visited.insert(child.pid) {
                    continue;
                }
                descendants.push((*child).clone());
                queue.push_back(child.pid);
            }
        }
    }
    descendants
}

#[cfg(unix)]
async fn query_process_table(timeout: Duration) -> Result<Vec<ProcessSnapshot>> {
    let mut query = tokio::process::Command::new("ps");
    query.args(["-axo", "pid=,ppid=,state=,rss=,%cpu=,args="]);
    let output = tokio::time::timeout(timeout, query.output())
        .await
        .map_err(|_| SupervisorError::ProcessListUnavailable("ps timed out".to_string()))?
        .map_err(|err| SupervisorError::ProcessListUnavailable(err.to_string()))?;

    if !output.status.success() {
        return Err(SupervisorError::ProcessListUnavailable(format!(
            "ps exited with {}",
            output.status.code().unwrap_or(1)
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(parse_process_table(&text))
}

#[cfg(not(unix))]
async fn query_process_table(_timeout: Duration) -> Result<Vec<ProcessSnapshot>> {
    Err(SupervisorError::ProcessListUnavailable(
        "no process table backend on this platform".to_string(),
    ))
}

/// Parses `ps -axo pid=,ppid=,state=,rss=,%cpu=,args=` output. Rows that do
/// not parse are skipped rather than failing the whole query.
pub fn parse_process_table(text: &str) -> Vec<ProcessSnapshot> {
    text.lines().filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<ProcessSnapshot> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse::<u32>().ok()?;
    let parent_pid = fields.next()?.parse::<u32>().ok()?;
    let raw_state = fields.next()?.to_string();
    let memory_kb = fields.next()?.parse::<u64>().unwrap_or(0);
    let cpu_percent = fields.next()?.parse::<f32>().unwrap_or(0.0);
    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    Some(ProcessSnapshot {
        pid,
        parent_pid,
        raw_state,
        command,
        memory_kb,
        cpu_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pid: u32, ppid: u32, command: &str) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            parent_pid: ppid,
            raw_state: "S".to_string(),
            command: command.to_string(),
            memory_kb: 1024,
            cpu_percent: 0.0,
        }
    }

    #[test]
    fn parses_typical_rows() {
        let text = "\
    1     0 Ss     1234  0.0 /sbin/init splash
  412     1 S<sl  88200  1.5 /usr/bin/some-daemon --flag value
 9001   412 R+     512  12.3 sleep 2
";
        let rows = parse_process_table(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].pid, 1);
        assert_eq!(rows[0].parent_pid, 0);
        assert_eq!(rows[0].raw_state, "Ss");
        assert_eq!(rows[0].command, "/sbin/init splash");
        assert_eq!(rows[1].memory_kb, 88200);
        assert_eq!(rows[2].raw_state, "R+");
        assert!((rows[2].cpu_percent - 12.3).abs() < f32::EPSILON);
        assert_eq!(rows[2].command, "sleep 2");
    }

    #[test]
    fn skips_malformed_rows() {
        let text = "garbage line\n 10 1 S 100 0.0 sh\nnot a pid 2 R 1 0.0 x\n";
        let rows = parse_process_table(text);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 10);
    }

    #[test]
    fn descendants_include_grandchildren() {
        let table = vec![
            row(100, 1, "sh"),
            row(200, 100, "npm run dev"),
            row(300, 200, "node server.js"),
            row(400, 300, "node worker.js"),
            row(999, 1, "unrelated"),
        ];
        let descendants = collect_descendants(&table, 100);
        let pids: Vec<u32> = descendants.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![200, 300, 400]);
    }

    #[test]
    fn root_without_children_yields_empty() {
        let table = vec![row(100, 1, "sh"), row(200, 1, "other")];
        assert!(collect_descendants(&table, 100).is_empty());
    }

    #[test]
    fn missing_root_yields_empty() {
        let table = vec![row(200, 100, "child")];
        // Descendants of a pid absent from the table still resolve through
        // the ppid index.
        assert_eq!(collect_descendants(&table, 100).len(), 1);
        assert!(collect_descendants(&table, 9999).is_empty());
    }

    #[test]
    fn self_parented_row_does_not_loop() {
        let mut table = vec![row(100, 1, "sh")];
        table.push(row(100, 100, "weird"));
        let descendants = collect_descendants(&table, 100);
        assert!(descendants.is_empty());
    }

    #[test]
    fn ppid_cycle_terminates_with_each_pid_once() {
        // 100 → 200 → 100: a cycle through the root must not spin the walk.
        let table = vec![row(200, 100, "child"), row(100, 200, "parent")];
        let descendants = collect_descendants(&table, 100);
        let pids: Vec<u32> = descendants.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![200]);

        // A cycle below the root is walked once as well.
        let table = vec![
            row(200, 100, "a"),
            row(300, 200, "b"),
            row(200, 300, "a-again"),
        ];
        let descendants = collect_descendants(&table, 100);
        assert_eq!(descendants.len(), 2);
    }

    #[test]
    fn program_extracts_basename() {
        let snap = row(1, 0, "/usr/local/bin/node server.js --port 3000");
        assert_eq!(snap.program(), "node");
        let snap = row(1, 0, "sleep 2");
        assert_eq!(snap.program(), "sleep");
    }

    #[tokio::test]
    async fn expired_query_budget_reports_unavailable() {
        let err = list_descendants(1, Duration::from_nanos(1))
            .await
            .expect_err("deadline cannot be met");
        assert!(matches!(err, SupervisorError::ProcessListUnavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_query_sees_own_process() {
        let table = query_process_table(Duration::from_secs(5))
            .await
            .expect("process table should be available on unix");
        let own = std::process::id();
        assert!(table.iter().any(|p| p.pid == own));
    }
}
