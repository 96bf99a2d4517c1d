use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::error::{Error, Result};

/// Events emitted over the lifetime of one preparation run. Jobs are
/// per-flavor; everything before fan-out is attributed to the "run" job.
#[derive(Debug, Clone)]
pub enum RunEvent {
    JobSpawned {
        job: String,
    },
    JobPhase {
        job: String,
        phase: String,
    },
    JobLog {
        job: String,
        line: String,
    },
    JobFinished {
        job: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait RunSink: Send + Sync {
    fn emit(&self, ev: RunEvent);
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    jobs_ok: usize,
    jobs_failed: usize,
    failed_jobs: Vec<String>,
    phases: BTreeMap<String, String>,
}

/// Prints run progress and a final summary, dropping terminal escape
/// sequences coming from subprocess output.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

impl RunSink for StdoutSink {
    fn emit(&self, ev: RunEvent) {
        match ev {
            RunEvent::JobSpawned { job } => {
                if let Ok(mut s) = self.state.lock() {
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {job}");
            }
            RunEvent::JobPhase { job, phase } => {
                if let Ok(mut s) = self.state.lock() {
                    s.phases.insert(job.clone(), phase.clone());
                }
                println!("PHASE: {job} -> {phase}");
            }
            RunEvent::JobLog { job, line } => {
                println!("[{job}] {line}");
            }
            RunEvent::JobFinished {
                job,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.jobs_ok += 1;
                    } else {
                        s.jobs_failed += 1;
                        s.failed_jobs.push(job.clone());
                    }
                }
                if ok {
                    println!("DONE: {job} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {job} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            RunEvent::RunDone { ok, error } => {
                let mut summary = String::from("SUMMARY:\n");
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if ok { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  jobs: ok={} failed={}\n",
                        s.jobs_ok, s.jobs_failed
                    ));
                    summary.push_str(&format!("  elapsed_secs: {}\n", wall.as_secs()));
                    if !s.failed_jobs.is_empty() {
                        let mut failed = s.failed_jobs.clone();
                        failed.sort();
                        failed.dedup();
                        summary.push_str(&format!("  failed_jobs: {}\n", failed.join(", ")));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if !ok {
                    if let Some(e) = error {
                        println!("  error: {e}");
                    }
                }
            }
        }
    }
}

/// Forwards events into an mpsc channel; used by tests to assert on the
/// exact event stream.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RunEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx }
    }
}

impl RunSink for ChannelSink {
    fn emit(&self, ev: RunEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Per-job handle carried through every pipeline step: knows which job it
/// logs for and owns the shared event sink. Cloned into worker and
/// download threads.
#[derive(Clone)]
pub struct RunCtx {
    pub sink: Arc<dyn RunSink>,
    job: String,
}

impl RunCtx {
    pub fn new(sink: Arc<dyn RunSink>) -> Self {
        Self {
            sink,
            job: "run".into(),
        }
    }

    pub fn for_job(&self, job: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            job: job.into(),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(RunEvent::JobLog {
            job: self.job.clone(),
            line: msg.to_string(),
        });
    }

    pub fn phase(&self, phase: &str) {
        self.sink.emit(RunEvent::JobPhase {
            job: self.job.clone(),
            phase: phase.to_string(),
        });
    }

    /// Runs a subprocess with line-buffered output streamed through the
    /// sink. On unix the child gets its own process group so a failure
    /// can't leave stray grandchildren attached to our terminal.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed for {:?}: {e}", cmd)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if line.is_empty() {
                continue;
            }
            self.log(&line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::msg(format!("command failed: {status}")));
        }
        Ok(())
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

const MAX_LOG_CHARS: usize = 4096;

/// Strips ANSI escape sequences and control characters from a subprocess
/// output line so it is safe to print to a terminal.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut truncated = false;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequences end on a final byte in '@'..='~'; OSC sequences
            // end on BEL. Anything else: drop the introducer pair.
            match chars.peek().copied() {
                Some('[') => {
                    chars.next();
                    for t in chars.by_ref() {
                        if ('@'..='~').contains(&t) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    for t in chars.by_ref() {
                        if t == '\x07' {
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
        }
        if out.chars().count() >= MAX_LOG_CHARS {
            truncated = true;
            break;
        }
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }
    out
}
