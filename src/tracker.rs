//! Operation tracking: every logical action on a node begins, then ends
//! exactly once as a success or a failure.
//!
//! `ConsoleTracker` renders one status line per operation,
//! `AggregatingTracker` collects failures for headless runs and
//! `JournalingTracker` appends every transition to a JSONL journal.

use crate::error::{is_timeout, FailureReport, RecordedFailure};
use crate::log::{OperationJournal, OperationStatus};
use anyhow::{anyhow, Result};
use crossterm::style::{Color, Stylize};
use parking_lot::Mutex;
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub id: u64,
    pub node: String,
    pub message: String,
}

pub trait Tracker: Send + Sync {
    fn begin(&self, record: &OperationRecord);
    fn success(&self, record: &OperationRecord);
    fn failed(&self, record: &OperationRecord, cause: &anyhow::Error);
}

/// A started operation. Finishing consumes it; dropping it unfinished
/// records a failure.
pub struct Operation {
    record: OperationRecord,
    tracker: Arc<dyn Tracker>,
    finished: bool,
}

impl Operation {
    pub fn start(tracker: Arc<dyn Tracker>, node: &str, message: impl Into<String>) -> Self {
        let record = OperationRecord {
            id: NEXT_OPERATION.fetch_add(1, Ordering::Relaxed),
            node: node.to_string(),
            message: message.into(),
        };
        tracker.begin(&record);
        Self {
            record,
            tracker,
            finished: false,
        }
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn succeed(mut self) {
        self.finished = true;
        self.tracker.success(&self.record);
    }

    pub fn fail(mut self, cause: &anyhow::Error) {
        self.finished = true;
        self.tracker.failed(&self.record, cause);
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker
                .failed(&self.record, &anyhow!("operation abandoned before completion"));
        }
    }
}

/// Run `fut` as one tracked operation
pub async fn tracked<T, F>(
    tracker: &Arc<dyn Tracker>,
    node: &str,
    message: impl Into<String>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let op = Operation::start(tracker.clone(), node, message);
    match fut.await {
        Ok(v) => {
            op.succeed();
            Ok(v)
        }
        Err(e) => {
            op.fail(&e);
            Err(e)
        }
    }
}

const ELLIPSIS: &str = "...";
const TAG_WIDTH: usize = 9;
const FALLBACK_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Failed,
    Timeout,
}

impl Status {
    fn tag(self) -> &'static str {
        match self {
            Status::Ok => "[  OK  ]",
            Status::Failed => "[FAILED]",
            Status::Timeout => "[TIMEOUT]",
        }
    }

    fn color(self) -> Color {
        match self {
            Status::Ok => Color::Green,
            Status::Failed => Color::Red,
            Status::Timeout => Color::Yellow,
        }
    }
}

fn take_width(chars: impl Iterator<Item = char>, budget: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for c in chars {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out
}

/// Fit `text` into exactly `width` columns. Overlong text loses its middle;
/// the trailing file name is kept whole when it fits.
pub fn fit_line(text: &str, width: usize) -> String {
    let text_width = text.width();
    if text_width <= width {
        return format!("{}{}", text, " ".repeat(width - text_width));
    }
    if width <= ELLIPSIS.len() {
        return take_width(text.chars(), width);
    }
    let room = width - ELLIPSIS.len();

    if let Some(pos) = text.rfind(['/', '\\']) {
        let tail = &text[pos..];
        let tail_width = tail.width();
        if tail_width < room {
            let head = take_width(text.chars(), room - tail_width);
            let line = format!("{head}{ELLIPSIS}{tail}");
            let pad = width.saturating_sub(line.width());
            return format!("{}{}", line, " ".repeat(pad));
        }
    }

    let left = take_width(text.chars(), room / 2);
    let right_budget = room - left.width();
    let right: String = {
        let mut rev = take_width(text.chars().rev(), right_budget)
            .chars()
            .collect::<Vec<_>>();
        rev.reverse();
        rev.into_iter().collect()
    };
    let line = format!("{left}{ELLIPSIS}{right}");
    let pad = width.saturating_sub(line.width());
    format!("{}{}", line, " ".repeat(pad))
}

struct ConsoleState {
    out: Box<dyn Write + Send>,
    /// Operation whose line is printed but not yet terminated
    open: Option<u64>,
}

pub struct ConsoleTracker {
    state: Mutex<ConsoleState>,
    width: usize,
    color: bool,
    verbose: bool,
}

impl ConsoleTracker {
    /// Write to stdout, sized to the terminal
    pub fn stdout(verbose: bool) -> Self {
        let width = crossterm::terminal::size()
            .map(|(cols, _)| cols as usize)
            .unwrap_or(FALLBACK_WIDTH);
        Self::with_writer(Box::new(std::io::stdout()), width, true, verbose)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, width: usize, color: bool, verbose: bool) -> Self {
        Self {
            state: Mutex::new(ConsoleState { out, open: None }),
            width: width.max(TAG_WIDTH + 8),
            color,
            verbose,
        }
    }

    fn text_width(&self) -> usize {
        self.width - TAG_WIDTH - 1
    }

    fn line_for(&self, record: &OperationRecord) -> String {
        fit_line(&format!("[{}] {}", record.node, record.message), self.text_width())
    }

    fn tag(&self, status: Status) -> String {
        let tag = format!("{:>width$}", status.tag(), width = TAG_WIDTH);
        if self.color {
            tag.with(status.color()).bold().to_string()
        } else {
            tag
        }
    }

    fn finish(&self, record: &OperationRecord, status: Status, detail: Option<Vec<String>>) {
        let mut st = self.state.lock();
        let line = if st.open == Some(record.id) {
            String::new()
        } else {
            // Another line was started meanwhile, repeat ours in full
            if st.open.is_some() {
                let _ = writeln!(st.out);
            }
            self.line_for(record)
        };
        let _ = writeln!(st.out, "{} {}", line, self.tag(status));
        st.open = None;
        for d in detail.unwrap_or_default() {
            let _ = writeln!(st.out, "    {d}");
        }
        let _ = st.out.flush();
    }
}

impl Tracker for ConsoleTracker {
    fn begin(&self, record: &OperationRecord) {
        let mut st = self.state.lock();
        if st.open.is_some() {
            let _ = writeln!(st.out);
        }
        let _ = write!(st.out, "{}", self.line_for(record));
        let _ = st.out.flush();
        st.open = Some(record.id);
    }

    fn success(&self, record: &OperationRecord) {
        self.finish(record, Status::Ok, None);
    }

    fn failed(&self, record: &OperationRecord, cause: &anyhow::Error) {
        let status = if is_timeout(cause) {
            Status::Timeout
        } else {
            Status::Failed
        };
        let mut detail = vec![cause.to_string()];
        if self.verbose {
            detail.extend(cause.chain().skip(1).map(|c| format!("  caused by: {c}")));
        }
        self.finish(record, status, Some(detail));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Success,
    Failed(String),
}

/// Silent tracker for headless runs
#[derive(Default)]
pub struct AggregatingTracker {
    records: Mutex<Vec<(OperationRecord, Outcome)>>,
    failures: Mutex<Vec<RecordedFailure>>,
}

impl AggregatingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, record: &OperationRecord, outcome: Outcome) {
        let mut records = self.records.lock();
        match records.iter_mut().find(|(r, _)| r.id == record.id) {
            Some(entry) => entry.1 = outcome,
            None => records.push((record.clone(), outcome)),
        }
    }

    pub fn records(&self) -> Vec<(OperationRecord, Outcome)> {
        self.records.lock().clone()
    }

    pub fn failures(&self) -> Vec<RecordedFailure> {
        self.failures.lock().clone()
    }

    /// Hands back every failure recorded so far as one `FailureReport`
    pub fn throw_on_any_failure(&self) -> Result<()> {
        let failures = std::mem::take(&mut *self.failures.lock());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FailureReport { failures }.into())
        }
    }
}

impl Tracker for AggregatingTracker {
    fn begin(&self, record: &OperationRecord) {
        self.set(record, Outcome::Pending);
    }

    fn success(&self, record: &OperationRecord) {
        self.set(record, Outcome::Success);
    }

    fn failed(&self, record: &OperationRecord, cause: &anyhow::Error) {
        self.set(record, Outcome::Failed(format!("{cause:#}")));
        self.failures.lock().push(RecordedFailure {
            node: record.node.clone(),
            message: record.message.clone(),
            cause: format!("{cause:#}"),
            timed_out: is_timeout(cause),
        });
    }
}

/// Forwards to another tracker and journals every transition
pub struct JournalingTracker {
    inner: Arc<dyn Tracker>,
    journal: OperationJournal,
}

impl JournalingTracker {
    pub fn new(inner: Arc<dyn Tracker>, journal: OperationJournal) -> Self {
        Self { inner, journal }
    }

    fn write(&self, record: &OperationRecord, status: OperationStatus, error: Option<String>) {
        if let Err(e) = self.journal.record(&record.node, &record.message, status, error) {
            eprintln!("warning: journal write failed: {e:#}");
        }
    }
}

impl Tracker for JournalingTracker {
    fn begin(&self, record: &OperationRecord) {
        self.write(record, OperationStatus::Started, None);
        self.inner.begin(record);
    }

    fn success(&self, record: &OperationRecord) {
        self.write(record, OperationStatus::Succeeded, None);
        self.inner.success(record);
    }

    fn failed(&self, record: &OperationRecord, cause: &anyhow::Error) {
        let status = if is_timeout(cause) {
            OperationStatus::TimedOut
        } else {
            OperationStatus::Failed
        };
        self.write(record, status, Some(format!("{cause:#}")));
        self.inner.failed(record, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeployError, NodeError};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn console(width: usize, verbose: bool) -> (Arc<dyn Tracker>, Capture) {
        let cap = Capture::default();
        let tracker = ConsoleTracker::with_writer(Box::new(cap.clone()), width, false, verbose);
        (Arc::new(tracker), cap)
    }

    fn timeout_error() -> anyhow::Error {
        NodeError::wrap(
            "web01",
            anyhow::Error::new(DeployError::Timeout {
                path: "setup.exe".into(),
                timeout: Duration::from_secs(1),
            }),
        )
    }

    #[test]
    fn short_text_is_padded_to_width() {
        let line = fit_line("copy a.txt", 20);
        assert_eq!(line.len(), 20);
        assert!(line.starts_with("copy a.txt"));
    }

    #[test]
    fn long_path_keeps_file_name() {
        let text = "Copying /very/long/directory/structure/that/goes/on/setup.exe";
        let line = fit_line(text, 30);
        assert_eq!(line.width(), 30);
        assert!(line.trim_end().ends_with("/setup.exe"), "{line}");
        assert!(line.contains(ELLIPSIS));
    }

    #[test]
    fn long_name_is_cut_in_the_middle() {
        let text = "x".repeat(20) + &"y".repeat(20);
        let line = fit_line(&text, 21);
        assert_eq!(line, format!("{}{}{}", "x".repeat(9), ELLIPSIS, "y".repeat(9)));
    }

    #[test]
    fn wide_characters_count_as_two_columns() {
        let line = fit_line("配置ファイル", 20);
        assert_eq!(line.width(), 20);
    }

    #[test]
    fn console_prints_tags() {
        let (tracker, cap) = console(60, false);
        Operation::start(tracker.clone(), "web01", "Copying a.bin").succeed();
        Operation::start(tracker.clone(), "web01", "Starting spooler")
            .fail(&anyhow!("access denied"));
        Operation::start(tracker.clone(), "web01", "Installing").fail(&timeout_error());

        let text = cap.text();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].starts_with("[web01] Copying a.bin"));
        assert!(lines[0].ends_with("[  OK  ]"));
        assert_eq!(lines[0].width(), 60);
        assert!(lines[1].ends_with("[FAILED]"));
        assert_eq!(lines[2].trim(), "access denied");
        assert!(lines[3].ends_with("[TIMEOUT]"));
    }

    #[test]
    fn interleaved_operations_reprint_their_line() {
        let (tracker, cap) = console(50, false);
        let a = Operation::start(tracker.clone(), "web01", "first");
        let b = Operation::start(tracker.clone(), "db01", "second");
        a.succeed();
        b.succeed();
        let text = cap.text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("[web01] first") && !lines[0].contains("OK"));
        assert!(lines[1].starts_with("[db01] second") && !lines[1].contains("OK"));
        assert!(lines[2].starts_with("[web01] first") && lines[2].ends_with("[  OK  ]"));
        assert!(lines[3].starts_with("[db01] second") && lines[3].ends_with("[  OK  ]"));
    }

    #[test]
    fn verbose_prints_cause_chain() {
        let err = anyhow!("disk full").context("write chunk").context("copy a.bin");
        let (tracker, cap) = console(60, true);
        Operation::start(tracker, "web01", "Copying").fail(&err);
        let text = cap.text();
        assert!(text.contains("caused by: write chunk"));
        assert!(text.contains("caused by: disk full"));

        let (tracker, cap) = console(60, false);
        Operation::start(tracker, "web01", "Copying").fail(&err);
        assert!(!cap.text().contains("disk full"));
    }

    #[test]
    fn dropped_operation_counts_as_failed() {
        let agg = Arc::new(AggregatingTracker::new());
        let tracker: Arc<dyn Tracker> = agg.clone();
        drop(Operation::start(tracker, "web01", "abandoned"));
        let failures = agg.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].cause.contains("abandoned"));
    }

    #[test]
    fn aggregating_tracker_reports_every_failure() {
        let agg = Arc::new(AggregatingTracker::new());
        let tracker: Arc<dyn Tracker> = agg.clone();
        Operation::start(tracker.clone(), "web01", "ok").succeed();
        Operation::start(tracker.clone(), "web01", "bad").fail(&anyhow!("boom"));
        Operation::start(tracker.clone(), "db01", "slow").fail(&timeout_error());

        assert_eq!(agg.records().len(), 3);
        assert_eq!(agg.records()[0].1, Outcome::Success);
        let err = agg.throw_on_any_failure().unwrap_err();
        let report = err.downcast_ref::<FailureReport>().unwrap();
        assert_eq!(report.failures.len(), 2);
        assert!(is_timeout(&err));
        agg.throw_on_any_failure().unwrap();
    }

    #[tokio::test]
    async fn tracked_finishes_exactly_once() {
        let agg = Arc::new(AggregatingTracker::new());
        let tracker: Arc<dyn Tracker> = agg.clone();
        let v = tracked(&tracker, "web01", "compute", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        let err: Result<()> = tracked(&tracker, "web01", "explode", async { Err(anyhow!("x")) }).await;
        assert!(err.is_err());
        let records = agg.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1, Outcome::Failed("x".into()));
    }

    #[test]
    fn journaling_tracker_records_transitions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let journal = OperationJournal::new(&tmp.path().join("j.jsonl"));
        let agg = Arc::new(AggregatingTracker::new());
        let tracker: Arc<dyn Tracker> = Arc::new(JournalingTracker::new(agg.clone(), journal));
        Operation::start(tracker.clone(), "web01", "slow").fail(&timeout_error());
        let entries = OperationJournal::new(&tmp.path().join("j.jsonl"))
            .read_entries()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, OperationStatus::TimedOut);
        assert_eq!(agg.failures().len(), 1);
    }
}
