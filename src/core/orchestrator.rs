//! Script runner: expand a script, compile every resolved run serially or on
//! a worker pool, and report progress to an observer.
//!
//! Workers are threads pulling run indices from a shared cursor over an
//! immutable [`RunBatch`]. Compilation never changes the process working
//! directory, so threads are safe here.

use super::compiler::{self, CompileContext};
use super::expander;
use super::types::*;
use crate::journal::eventlog::{self, Journal};
use crate::toolchain;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receives orchestrator events. Every method defaults to a no-op.
pub trait ProgressObserver {
    /// Worker count; `None` when multiprocessing is disabled.
    fn on_cpu_count(&mut self, _workers: Option<usize>) {}
    fn on_progress(&mut self, _completed: usize, _total: usize, _elapsed_seconds: f64) {}
    fn on_success_ratio(&mut self, _success: usize, _total: usize) {}
    fn on_abort(&mut self) {}
    fn on_finished(&mut self, _elapsed_seconds: f64) {}
}

impl ProgressObserver for mpsc::Sender<RunnerEvent> {
    fn on_cpu_count(&mut self, workers: Option<usize>) {
        let _ = self.send(RunnerEvent::CpuCount(workers));
    }

    fn on_progress(&mut self, completed: usize, total: usize, elapsed_seconds: f64) {
        let _ = self.send(RunnerEvent::Progress {
            completed,
            total,
            elapsed_seconds,
        });
    }

    fn on_success_ratio(&mut self, success: usize, total: usize) {
        let _ = self.send(RunnerEvent::SuccessRatio { success, total });
    }

    fn on_abort(&mut self) {
        let _ = self.send(RunnerEvent::Aborted);
    }

    fn on_finished(&mut self, elapsed_seconds: f64) {
        let _ = self.send(RunnerEvent::Finished { elapsed_seconds });
    }
}

/// Cooperative abort flag shared with workers.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// CPUs in the `Cpus_allowed` mask of a `/proc/<pid>/status` dump.
pub fn cpus_allowed(status: &str) -> Option<usize> {
    let re = regex::Regex::new(r"(?m)^Cpus_allowed:\s*([0-9a-fA-F,]+)\s*$").ok()?;
    let mask = re.captures(status)?.get(1)?.as_str();
    let count: u32 = mask
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(u32::count_ones)
        .sum();
    (count > 0).then_some(count as usize)
}

/// CPUs this process may run on.
pub fn available_cpu_count() -> usize {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| cpus_allowed(&s))
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}

/// Worker count: `jobs` if given, else `min(max_cpus, cpus)`. `None` when
/// multiprocessing is disabled.
pub fn worker_count(prefs: &Preferences, cpus: usize, jobs: Option<usize>) -> Option<usize> {
    if !prefs.multiprocessing {
        return None;
    }
    let n = match (jobs, prefs.cpu_cap()) {
        (Some(j), _) => j,
        (None, Some(cap)) => cap.min(cpus),
        (None, None) => cpus,
    };
    Some(n.max(1))
}

/// Expand `script`, seeding random sweeps from `sweep_seed` when set.
pub fn prepare_batch(script: &Script, prefs: &Preferences) -> Result<RunBatch, String> {
    match prefs.sweep_seed {
        Some(seed) => expander::prepare(script, &mut StdRng::seed_from_u64(seed)),
        None => expander::prepare(script, &mut rand::rng()),
    }
}

/// Result of a script run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Reports in batch order (completed runs only when aborted)
    pub reports: Vec<RunReport>,
    pub total: usize,
    pub aborted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }
}

/// Drives every resolved run of one script.
#[derive(Debug)]
pub struct ScriptRunner {
    batch: RunBatch,
    prefs: Preferences,
    work_dir: PathBuf,
    jobs: Option<usize>,
    abort: AbortHandle,
}

impl ScriptRunner {
    pub fn new(batch: RunBatch, prefs: Preferences, work_dir: &Path) -> Self {
        Self {
            batch,
            prefs,
            work_dir: work_dir.to_path_buf(),
            jobs: None,
            abort: AbortHandle::default(),
        }
    }

    /// Expand `script` and build a runner for it.
    pub fn prepare(script: &Script, prefs: Preferences, work_dir: &Path) -> Result<Self, String> {
        let batch = prepare_batch(script, &prefs)?;
        Ok(Self::new(batch, prefs, work_dir))
    }

    /// Override the worker count.
    pub fn with_jobs(mut self, jobs: Option<usize>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn batch(&self) -> &RunBatch {
        &self.batch
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run every resolved run, blocking until done or aborted.
    pub fn run(&self, observer: &mut dyn ProgressObserver) -> RunSummary {
        let start = Instant::now();
        let total = self.batch.len();
        let script = &self.batch.script.name;
        let workers = worker_count(&self.prefs, available_cpu_count(), self.jobs);
        observer.on_cpu_count(workers);

        let run_id = eventlog::generate_run_id();
        let journal = self
            .prefs
            .journal
            .then(|| Journal::new(&self.work_dir.join("data"), script));
        let mut ctx = CompileContext::new(&self.work_dir, &self.prefs);
        if let Some(j) = &journal {
            ctx = ctx.with_journal(j);
            j.record(JournalEvent::ScriptStarted {
                script: script.clone(),
                run_id: run_id.clone(),
                total_runs: total,
                workers,
            });
        }
        log::info!(
            "{}: {} run(s), {}",
            script,
            total,
            workers.map_or("serial".to_string(), |n| format!("{} worker(s)", n))
        );

        let reports = match workers {
            Some(n) if n > 1 && total > 1 => self.run_parallel(&ctx, n, start, observer),
            _ => self.run_serial(&ctx, start, observer),
        };

        let summary = RunSummary {
            total,
            aborted: self.abort.is_aborted(),
            elapsed: start.elapsed(),
            reports,
        };
        if summary.aborted {
            if let Err(e) = toolchain::kill_simulators(&self.prefs.simulator_name) {
                log::warn!("{}", e);
            }
            log::warn!("{}: aborted after {} run(s)", script, summary.reports.len());
            if let Some(j) = &journal {
                j.record(JournalEvent::ScriptAborted {
                    script: script.clone(),
                    run_id,
                    completed: summary.reports.len(),
                });
            }
            observer.on_abort();
            return summary;
        }

        let succeeded = summary.succeeded();
        let seconds = summary.elapsed.as_secs_f64();
        log::info!("{}: {}/{} runs successful in {:.1}s", script, succeeded, total, seconds);
        if let Some(j) = &journal {
            j.record(JournalEvent::ScriptCompleted {
                script: script.clone(),
                run_id,
                succeeded,
                failed: summary.failed(),
                total_seconds: seconds,
            });
        }
        observer.on_success_ratio(succeeded, total);
        observer.on_finished(seconds);
        summary
    }

    fn run_serial(&self, ctx: &CompileContext<'_>, start: Instant, observer: &mut dyn ProgressObserver) -> Vec<RunReport> {
        let total = self.batch.len();
        let mut reports = Vec::with_capacity(total);
        for run in &self.batch.runs {
            if self.abort.is_aborted() {
                break;
            }
            reports.push(compiler::compile(&self.batch.script, run, ctx));
            observer.on_progress(reports.len(), total, start.elapsed().as_secs_f64());
        }
        reports
    }

    fn run_parallel(
        &self,
        ctx: &CompileContext<'_>,
        workers: usize,
        start: Instant,
        observer: &mut dyn ProgressObserver,
    ) -> Vec<RunReport> {
        let total = self.batch.len();
        let cursor = AtomicUsize::new(0);
        let mut slots: Vec<Option<RunReport>> = vec![None; total];
        let (tx, rx) = mpsc::channel::<(usize, RunReport)>();

        std::thread::scope(|s| {
            for _ in 0..workers.min(total) {
                let tx = tx.clone();
                let (cursor, batch, abort) = (&cursor, &self.batch, &self.abort);
                s.spawn(move || loop {
                    if abort.is_aborted() {
                        break;
                    }
                    let i = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(run) = batch.runs.get(i) else { break };
                    let report = compiler::compile(&batch.script, run, ctx);
                    if tx.send((i, report)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut completed = 0;
            for (i, report) in rx {
                completed += 1;
                slots[i] = Some(report);
                observer.on_progress(completed, total, start.elapsed().as_secs_f64());
            }
        });
        slots.into_iter().flatten().collect()
    }

    /// Run on a dedicated thread.
    pub fn spawn<O>(self, mut observer: O) -> RunnerHandle
    where
        O: ProgressObserver + Send + 'static,
    {
        let abort = self.abort.clone();
        let simulator = self.prefs.simulator_name.clone();
        let thread = std::thread::spawn(move || self.run(&mut observer));
        RunnerHandle {
            abort,
            simulator,
            thread,
        }
    }
}

/// Handle to a runner started with [`ScriptRunner::spawn`].
#[derive(Debug)]
pub struct RunnerHandle {
    abort: AbortHandle,
    simulator: String,
    thread: JoinHandle<RunSummary>,
}

impl RunnerHandle {
    /// Stop taking new runs and kill running simulators.
    pub fn abort(&self) {
        self.abort.abort();
        if let Err(e) = toolchain::kill_simulators(&self.simulator) {
            log::warn!("{}", e);
        }
    }

    pub fn join(self) -> Result<RunSummary, String> {
        self.thread
            .join()
            .map_err(|_| "script runner thread panicked".to_string())
    }
}
