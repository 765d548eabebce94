//! Git working-tree metrics attached to finished commands

use crate::error::SinkError;
use crate::events::CommandEvent;
use crate::sink::EventSink;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::trace;

/// Uncommitted changes, staged and unstaged combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffMetrics {
    pub files_touched: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
}

/// Per-file added/deleted counts from `git diff --numstat` output. Binary
/// files (`-`) count as touched with no lines.
fn parse_numstat(output: &str, into: &mut BTreeMap<String, (u64, u64)>) {
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(deleted), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let added = added.parse().unwrap_or(0);
        let deleted = deleted.parse().unwrap_or(0);
        let entry = into.entry(path.to_string()).or_insert((0, 0));
        entry.0 += added;
        entry.1 += deleted;
    }
}

fn numstat(repo: &Path, cached: bool) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(["diff", "--numstat"]);
    if cached {
        cmd.arg("--cached");
    }
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Diff metrics for the repository containing `repo`, or `None` when it is
/// not inside a work tree or git is unavailable.
pub fn collect_diff_metrics(repo: &Path) -> Option<DiffMetrics> {
    let working = numstat(repo, false)?;
    let staged = numstat(repo, true)?;

    let mut files = BTreeMap::new();
    parse_numstat(&working, &mut files);
    parse_numstat(&staged, &mut files);

    Some(DiffMetrics {
        files_touched: files.len() as u64,
        lines_added: files.values().map(|(added, _)| added).sum(),
        lines_deleted: files.values().map(|(_, deleted)| deleted).sum(),
    })
}

/// Sink adapter that fills [`CommandEvent::git`] for completed events before
/// passing them on.
pub struct GitMetricsSink<S> {
    inner: S,
}

impl<S: EventSink> GitMetricsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: EventSink> EventSink for GitMetricsSink<S> {
    fn deliver(&mut self, event: &CommandEvent) -> Result<(), SinkError> {
        let metrics = match (&event.cwd, event.is_completed()) {
            (Some(cwd), true) => collect_diff_metrics(Path::new(cwd)),
            _ => None,
        };
        let Some(metrics) = metrics else {
            return self.inner.deliver(event);
        };
        trace!(
            session_id = %event.session_id,
            files = metrics.files_touched,
            "Git metrics collected"
        );
        let mut event = event.clone();
        event.git = Some(metrics);
        self.inner.deliver(&event)
    }
}
