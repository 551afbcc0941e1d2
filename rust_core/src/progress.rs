//! Live progress for multi-chain NUTS.
//!
//! Every chain publishes its own counters and latest step size after each
//! iteration. A renderer thread polls them and redraws one status line on
//! stderr, so sampling threads never touch the terminal.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 24;
const REFRESH: Duration = Duration::from_millis(100);

/// Counters for one chain, written by the chain's sampler only.
#[derive(Debug, Default)]
pub struct ChainProgress {
    iterations: AtomicUsize,
    divergences: AtomicUsize,
    gradient_evaluations: AtomicUsize,
    /// `f64::to_bits` of the step size used by the latest iteration.
    step_size: AtomicU64,
}

impl ChainProgress {
    /// Record a finished iteration that took `leapfrog_steps` gradient
    /// evaluations.
    pub fn record(&self, step_size: f64, leapfrog_steps: usize, diverged: bool) {
        self.step_size.store(step_size.to_bits(), Ordering::Relaxed);
        self.gradient_evaluations.fetch_add(leapfrog_steps, Ordering::Relaxed);
        if diverged {
            self.divergences.fetch_add(1, Ordering::Relaxed);
        }
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn divergences(&self) -> usize {
        self.divergences.load(Ordering::Relaxed)
    }

    pub fn gradient_evaluations(&self) -> usize {
        self.gradient_evaluations.load(Ordering::Relaxed)
    }

    /// `None` until the first iteration is recorded.
    pub fn step_size(&self) -> Option<f64> {
        (self.iterations() > 0).then(|| f64::from_bits(self.step_size.load(Ordering::Relaxed)))
    }
}

/// Progress of a whole multi-chain run.
pub struct ProgressState {
    chains: Vec<ChainProgress>,
    iterations_per_chain: usize,
    adapt_count: usize,
    done: AtomicBool,
    started: Instant,
}

impl ProgressState {
    pub fn new(num_chains: usize, iterations_per_chain: usize, adapt_count: usize) -> Self {
        Self {
            chains: (0..num_chains).map(|_| ChainProgress::default()).collect(),
            iterations_per_chain,
            adapt_count,
            done: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn chains(&self) -> &[ChainProgress] {
        &self.chains
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.chains.iter().map(ChainProgress::iterations).sum()
    }

    pub fn divergences(&self) -> usize {
        self.chains.iter().map(ChainProgress::divergences).sum()
    }

    /// Still adapting while any chain is inside its adaptation window.
    fn phase(&self) -> &'static str {
        if self.chains.iter().any(|c| c.iterations() < self.adapt_count) {
            "warmup"
        } else {
            "sampling"
        }
    }

    /// One line: phase, overall bar, then step size and divergences per
    /// chain, then timing.
    pub fn status_line(&self) -> String {
        let total = self.chains.len() * self.iterations_per_chain;
        let completed = self.completed().min(total);
        let fraction = if total == 0 { 1.0 } else { completed as f64 / total as f64 };

        let mut line = format!(
            "{:<8} {} {:>3.0}% {}/{}",
            self.phase(),
            bar(fraction),
            fraction * 100.0,
            completed,
            total
        );
        for (index, chain) in self.chains.iter().enumerate() {
            let _ = match chain.step_size() {
                Some(eps) => write!(line, " │ #{index} ε={eps:.3} div={}", chain.divergences()),
                None => write!(line, " │ #{index} ε=-"),
            };
        }

        let elapsed = self.started.elapsed();
        if self.is_done() {
            let evaluations: usize = self.chains.iter().map(ChainProgress::gradient_evaluations).sum();
            write!(line, " │ {evaluations} grad evals │ {}", clock(elapsed)).ok();
        } else if completed > 0 && completed < total {
            let eta = elapsed.mul_f64((total - completed) as f64 / completed as f64);
            write!(line, " │ {} < ~{}", clock(elapsed), clock(eta)).ok();
        } else {
            write!(line, " │ {}", clock(elapsed)).ok();
        }
        line
    }
}

fn bar(fraction: f64) -> String {
    let filled = ((fraction.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

fn clock(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Redraw the status line until `state.finish()` is called, then print it
/// a final time with a newline.
pub fn spawn_progress_thread(state: Arc<ProgressState>) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        let done = state.is_done();
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{}\x1b[K", state.status_line());
        if done {
            let _ = writeln!(err);
            let _ = err.flush();
            return;
        }
        let _ = err.flush();
        drop(err);
        std::thread::sleep(REFRESH);
    })
}
