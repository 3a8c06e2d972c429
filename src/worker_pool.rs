//! Chromosome-parallel task execution
//!
//! One task per chromosome, at most `concurrency` running at once on a
//! private rayon pool. Outputs come back in the order of the chromosome
//! list no matter which task finishes first. A failing task never cancels
//! its siblings: every task runs to completion and the failures are
//! collected into a single verdict.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::PipelineError;
use crate::stage::Stage;

/// Memory budget reserved for each concurrently running chromosome task
pub const PER_WORKER_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Result of one chromosome task
#[derive(Debug)]
pub struct TaskOutput<T> {
    pub chrom: String,
    pub result: Result<T>,
}

impl<T> TaskOutput<T> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-task results in chromosome-list order
#[derive(Debug)]
pub struct PoolOutcome<T> {
    pub tasks: Vec<TaskOutput<T>>,
}

impl<T> PoolOutcome<T> {
    /// True only when every task succeeded
    pub fn success(&self) -> bool {
        self.tasks.iter().all(TaskOutput::succeeded)
    }

    pub fn failed_chromosomes(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !t.succeeded())
            .map(|t| t.chrom.clone())
            .collect()
    }

    /// Ordered outputs, or a worker fault naming every failed chromosome
    pub fn into_result(self, stage: Stage) -> Result<Vec<T>> {
        let total = self.tasks.len();
        let mut outputs = Vec::with_capacity(total);
        let mut failed = Vec::new();

        for task in self.tasks {
            match task.result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    warn!("[{stage}] task for {} failed: {e:#}", task.chrom);
                    failed.push(task.chrom);
                }
            }
        }

        if !failed.is_empty() {
            return Err(PipelineError::WorkerFault {
                stage,
                total,
                failed,
            }
            .into());
        }
        Ok(outputs)
    }
}

/// Bounded pool applying a per-chromosome function
pub struct ChromosomeWorkerPool {
    pool: rayon::ThreadPool,
    concurrency: usize,
}

impl ChromosomeWorkerPool {
    pub fn new(concurrency: usize) -> Result<Self> {
        let concurrency = concurrency.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|i| format!("megahic-chrom-{i}"))
            .build()
            .context("Failed to create chromosome worker pool")?;
        Ok(ChromosomeWorkerPool { pool, concurrency })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `task` once per chromosome and gather the results in list order
    ///
    /// A panic inside a task is reported as that task's failure.
    pub fn run<T, F>(&self, chromosomes: &[String], task: F) -> PoolOutcome<T>
    where
        T: Send,
        F: Fn(&str) -> Result<T> + Sync,
    {
        debug!(
            "Dispatching {} chromosome tasks on {} workers",
            chromosomes.len(),
            self.concurrency
        );

        let tasks = self.pool.install(|| {
            chromosomes
                .par_iter()
                .map(|chrom| {
                    let result = catch_unwind(AssertUnwindSafe(|| task(chrom)))
                        .unwrap_or_else(|panic| {
                            Err(anyhow!("task panicked: {}", panic_message(&*panic)))
                        });
                    TaskOutput {
                        chrom: chrom.clone(),
                        result,
                    }
                })
                .collect()
        });

        PoolOutcome { tasks }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Available physical memory in bytes, where the platform reports it
#[cfg(target_os = "linux")]
pub fn available_memory() -> Option<u64> {
    // SAFETY: sysconf only reads system configuration values
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some(pages as u64 * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn available_memory() -> Option<u64> {
    None
}

/// Half the CPUs, capped by how many worker budgets fit in memory
pub fn compute_concurrency(cpus: usize, memory: Option<u64>, per_worker: u64) -> usize {
    let by_cpu = (cpus / 2).max(1);
    let by_memory = memory
        .map(|bytes| (bytes / per_worker.max(1)) as usize)
        .unwrap_or(usize::MAX);
    by_cpu.min(by_memory).max(1)
}

/// Concurrency for this machine, logged with the numbers behind it
pub fn default_concurrency() -> usize {
    let cpus = num_cpus::get();
    let memory = available_memory();
    let workers = compute_concurrency(cpus, memory, PER_WORKER_MEMORY_BYTES);
    match memory {
        Some(bytes) => info!(
            "{cpus} CPUs, {} available at {} per worker: {workers} chromosome workers",
            format_bytes(bytes),
            format_bytes(PER_WORKER_MEMORY_BYTES)
        ),
        None => info!("{cpus} CPUs, available memory unknown: {workers} chromosome workers"),
    }
    workers
}

/// Size in binary units, one decimal above plain bytes
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
