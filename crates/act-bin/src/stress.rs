//! Randomized stress loops over the public controller API.
//!
//! Each loop prints `[fail]` lines as they happen, a progress line every 100
//! iterations, and returns a [`StressSummary`].

use std::fmt;
use std::time::Duration;

use act_hardware::ActuatorController;
use clap::{Args, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Instant};
use tracing::info;

const PROGRESS_EVERY: usize = 100;
const DELTA_TRIES: usize = 64;
const MAX_STRESS_SPEED: i32 = 30;

/// Which loop to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StressMode {
    /// Non-blocking relative moves, settled by polling the position
    Relative,
    /// Blocking relative moves
    RelativeBlocking,
    /// Blocking absolute moves to random targets
    Absolute,
    /// Repeated connect and disconnect
    Connect,
}

/// Parameters of `actctl stress`.
#[derive(Debug, Clone, Args)]
pub struct StressArgs {
    /// Loop to run
    #[arg(value_enum)]
    pub mode: StressMode,

    /// Number of iterations
    #[arg(long, default_value_t = 100)]
    pub iterations: usize,

    /// Lower bound of the position range
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub min_pos: i32,

    /// Upper bound of the position range
    #[arg(long, default_value_t = 70, allow_negative_numbers = true)]
    pub max_pos: i32,

    /// Largest relative step
    #[arg(long, default_value_t = 70, value_parser = clap::value_parser!(i32).range(1..))]
    pub max_step: i32,

    /// Settle deadline per move, in milliseconds
    #[arg(long, default_value_t = 1500, value_parser = clap::value_parser!(u64).range(1..))]
    pub settle_timeout_ms: u64,

    /// Allowed |actual - expected| (default: 1 for relative loops, 0 for absolute)
    #[arg(long)]
    pub tolerance: Option<u32>,

    /// Pause around connect and disconnect, in milliseconds
    #[arg(long, default_value_t = 50)]
    pub delay_ms: u64,

    /// RNG seed, for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Outcome of one stress loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressSummary {
    /// Loop that ran
    pub mode: StressMode,
    /// Iterations attempted
    pub iterations: usize,
    /// Iterations that met their check
    pub pass: usize,
    /// Iterations that did not
    pub fail: usize,
}

impl StressSummary {
    fn new(mode: StressMode, iterations: usize) -> Self {
        Self {
            mode,
            iterations,
            pass: 0,
            fail: 0,
        }
    }

    fn record(&mut self, ok: bool) {
        if ok {
            self.pass += 1;
        } else {
            self.fail += 1;
        }
    }

    fn progress(&self, i: usize) {
        if (i + 1) % PROGRESS_EVERY == 0 {
            println!(
                "[{}-progress] {}/{} pass={} fail={}",
                self.mode.tag(),
                i + 1,
                self.iterations,
                self.pass,
                self.fail
            );
        }
    }
}

impl fmt::Display for StressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}-summary] iterations={} pass={} fail={}",
            self.mode.tag(),
            self.iterations,
            self.pass,
            self.fail
        )
    }
}

impl StressMode {
    fn tag(self) -> &'static str {
        match self {
            StressMode::Relative => "rel",
            StressMode::RelativeBlocking => "rel-blocking",
            StressMode::Absolute => "abs",
            StressMode::Connect => "conn",
        }
    }
}

/// Ordered, non-negative position range.
fn normalize_range(min_pos: i32, max_pos: i32) -> (i32, i32) {
    let (lo, hi) = if min_pos > max_pos {
        (max_pos, min_pos)
    } else {
        (min_pos, max_pos)
    };
    (lo.max(0), hi.max(0))
}

/// Pick a non-zero displacement from `before` that stays inside `[min_pos, max_pos]`.
///
/// Tries random steps first. If none fits, steps toward the farther bound, or back
/// into range when `before` is outside it. Returns 0 only when `min_pos == max_pos == before`.
pub fn pick_delta<R: Rng>(rng: &mut R, before: i32, min_pos: i32, max_pos: i32, max_step: i32) -> i32 {
    for _ in 0..DELTA_TRIES {
        let candidate = rng.gen_range(-max_step..=max_step);
        if candidate == 0 {
            continue;
        }
        let target = before + candidate;
        if (min_pos..=max_pos).contains(&target) {
            return candidate;
        }
    }

    if before < min_pos {
        return max_step.min(min_pos - before);
    }
    if before > max_pos {
        return -max_step.min(before - max_pos);
    }
    let to_min = before - min_pos;
    let to_max = max_pos - before;
    let delta = if to_max >= to_min {
        max_step.min(to_max)
    } else {
        -max_step.min(to_min)
    };
    if delta != 0 {
        delta
    } else if to_max > 0 {
        1
    } else if to_min > 0 {
        -1
    } else {
        0
    }
}

/// Drives one stress loop against a controller.
pub struct StressRunner<'a> {
    actuator: &'a mut ActuatorController,
    args: StressArgs,
    poll_interval: Duration,
    rng: StdRng,
}

impl<'a> StressRunner<'a> {
    /// `poll_interval` paces the settle polling of the non-blocking relative loop.
    pub fn new(actuator: &'a mut ActuatorController, args: StressArgs, poll_interval: Duration) -> Self {
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            actuator,
            args,
            poll_interval,
            rng,
        }
    }

    /// Run the selected loop. Motion loops expect a connected controller.
    pub async fn run(&mut self, preferred: Option<&str>) -> StressSummary {
        info!(mode = ?self.args.mode, iterations = self.args.iterations, "Starting stress loop");
        let summary = match self.args.mode {
            StressMode::Relative => self.relative().await,
            StressMode::RelativeBlocking => self.relative_blocking().await,
            StressMode::Absolute => self.absolute_blocking().await,
            StressMode::Connect => self.connect_disconnect(preferred).await,
        };
        println!("{summary}");
        summary
    }

    fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.args.settle_timeout_ms)
    }

    fn speed(&mut self) -> i32 {
        self.rng.gen_range(1..=MAX_STRESS_SPEED)
    }

    async fn relative_blocking(&mut self) -> StressSummary {
        let (min_pos, max_pos) = normalize_range(self.args.min_pos, self.args.max_pos);
        let tolerance = self.args.tolerance.unwrap_or(1);
        let mut summary = StressSummary::new(StressMode::RelativeBlocking, self.args.iterations);

        let mut expected = self.actuator.get_current_position().await.clamp(min_pos, max_pos);
        for i in 0..self.args.iterations {
            let before = expected;
            let delta = pick_delta(&mut self.rng, before, min_pos, max_pos, self.args.max_step);
            let speed = self.speed();
            expected = (before + delta).clamp(min_pos, max_pos);

            let outcome = self
                .actuator
                .move_relative_blocking(delta, speed, self.settle_timeout(), tolerance)
                .await;
            let actual = self.actuator.get_current_position().await;
            let ok = outcome.is_ok() && actual.abs_diff(expected) <= tolerance;
            if !ok {
                let error = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                println!(
                    "[fail] i={i} before={before} delta={delta} speed={speed} expected={expected} got={actual} error={error:?}"
                );
            }
            summary.record(ok);
            summary.progress(i);
        }
        summary
    }

    async fn relative(&mut self) -> StressSummary {
        let (min_pos, max_pos) = normalize_range(self.args.min_pos, self.args.max_pos);
        let tolerance = self.args.tolerance.unwrap_or(1);
        let mut summary = StressSummary::new(StressMode::Relative, self.args.iterations);

        // Each step is based on the commanded target, not the last reading.
        let mut expected = self.actuator.get_current_position().await.clamp(min_pos, max_pos);
        for i in 0..self.args.iterations {
            let before = expected;
            let delta = pick_delta(&mut self.rng, before, min_pos, max_pos, self.args.max_step);
            let speed = self.speed();
            let sent = self.actuator.move_relative(delta, speed).await;
            expected = (before + delta).clamp(min_pos, max_pos);

            let mut actual = before;
            let started = Instant::now();
            while started.elapsed() < self.settle_timeout() {
                sleep(self.poll_interval).await;
                actual = self.actuator.get_current_position().await;
                if actual.abs_diff(expected) <= tolerance {
                    break;
                }
            }

            let ok = sent.is_ok() && actual.abs_diff(expected) <= tolerance;
            if !ok {
                println!(
                    "[fail] i={i} before={before} delta={delta} speed={speed} expected={expected} got={actual}"
                );
            }
            summary.record(ok);
            summary.progress(i);
        }
        summary
    }

    async fn absolute_blocking(&mut self) -> StressSummary {
        let (min_pos, max_pos) = normalize_range(self.args.min_pos, self.args.max_pos);
        let tolerance = self.args.tolerance.unwrap_or(0);
        let mut summary = StressSummary::new(StressMode::Absolute, self.args.iterations);

        for i in 0..self.args.iterations {
            let target = self.rng.gen_range(min_pos..=max_pos);
            let speed = self.speed();
            let outcome = self
                .actuator
                .move_absolute_blocking(target, speed, self.settle_timeout(), tolerance)
                .await;
            let actual = self.actuator.get_current_position().await;
            let ok = outcome.is_ok() && actual.abs_diff(target) <= tolerance;
            if !ok {
                let error = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                println!("[abs-fail] i={i} target={target} got={actual} error={error:?}");
            }
            summary.record(ok);
            summary.progress(i);
        }
        summary
    }

    async fn connect_disconnect(&mut self, preferred: Option<&str>) -> StressSummary {
        let delay = Duration::from_millis(self.args.delay_ms);
        let mut summary = StressSummary::new(StressMode::Connect, self.args.iterations);

        for i in 0..self.args.iterations {
            if self.actuator.is_connected() {
                self.actuator.disconnect().await;
                sleep(delay).await;
            }

            if let Err(e) = self.actuator.connect(preferred).await {
                println!("[conn-fail] i={i} error={e}");
                summary.record(false);
                summary.progress(i);
                continue;
            }
            if i == 0 {
                match (preferred, self.actuator.port_name()) {
                    (Some(requested), Some(actual)) if requested != actual => {
                        println!("[connect-ok] requested={requested} actual={actual}");
                    }
                    (_, Some(actual)) => println!("[connect-ok] {actual}"),
                    _ => {}
                }
            }

            sleep(delay).await;
            self.actuator.disconnect().await;
            sleep(delay).await;

            let ok = !self.actuator.is_connected();
            if !ok {
                println!("[disc-fail] i={i}");
            }
            summary.record(ok);
            summary.progress(i);
        }
        summary
    }
}
