use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use muxconfig::{ConsumeMode, MuxConfig, TargetConfig};
use serde::Serialize;
use texmux::{
    ConsumePolicy, ConsumedFrame, ContextConfig, DrawContext, FeedRenderer, GpuResource,
    GraphicsBackend, HandleArena, HeadlessBackend, MuxOptions, Multiplexer, SurfaceTarget,
    SwitchReport, TargetSpec,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{BackendKind, RunArgs};
use crate::producer::Producer;

const DEFAULT_TARGETS: usize = 2;

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let plan = RunPlan {
        duration: args.duration,
        switch_every: args.switch_every.or_else(|| config.switch_interval()),
    };
    tracing::info!(
        targets = config.targets.len(),
        backend = args.backend.as_str(),
        duration_ms = plan.duration.as_millis() as u64,
        switch_every = ?plan.switch_every,
        "starting camswitch session"
    );

    let summary = match args.backend {
        BackendKind::Headless => run_headless(&config, &plan)?,
        BackendKind::Wgpu => run_wgpu(&config, &plan)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    if summary.leaked_handles > 0 {
        bail!("{} graphics handles leaked", summary.leaked_handles);
    }
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<MuxConfig> {
    if let Some(path) = &args.config {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        return MuxConfig::from_toml_str(&raw)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    let count = args.targets.unwrap_or(DEFAULT_TARGETS);
    if count == 0 {
        bail!("--targets must be at least 1");
    }
    let mut config = MuxConfig::from_toml_str(muxconfig::SAMPLE_CONFIG)?;
    config.initial = None;
    config.targets = (0..count)
        .map(|index| TargetConfig {
            name: format!("target-{index}"),
            width: 320,
            height: 240,
            present_interval: Some(Duration::from_millis(16)),
            samples: None,
            swap_interval: None,
        })
        .collect();
    config.validate()?;
    Ok(config)
}

struct RunPlan {
    duration: Duration,
    switch_every: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    backend: &'static str,
    duration_ms: u64,
    frames_pushed: u64,
    frames_received: u64,
    texture_generations: u64,
    targets: Vec<TargetSummary>,
    switches: Vec<SwitchSummary>,
    leaked_handles: usize,
}

#[derive(Debug, Serialize)]
struct TargetSummary {
    name: String,
    frames_presented: u64,
    frames_drawn: u64,
    fresh_frames: u64,
    last_sequence: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SwitchSummary {
    from: Option<String>,
    to: String,
    detach_us: u64,
    attach_us: u64,
}

impl From<&SwitchReport> for SwitchSummary {
    fn from(report: &SwitchReport) -> Self {
        Self {
            from: report.from.clone(),
            to: report.to.clone(),
            detach_us: report.detach.as_micros() as u64,
            attach_us: report.attach.as_micros() as u64,
        }
    }
}

#[derive(Default)]
struct DrawStats {
    drawn: AtomicU64,
    fresh: AtomicU64,
    last_sequence: AtomicU64,
}

/// Counts the frames a target draws while it holds the feed.
struct StatsRenderer {
    stats: Arc<DrawStats>,
}

impl FeedRenderer for StatsRenderer {
    fn on_frame(&mut self, _ctx: &mut DrawContext<'_>, frame: &ConsumedFrame) -> Result<()> {
        self.stats.drawn.fetch_add(1, Ordering::Relaxed);
        if frame.fresh {
            self.stats.fresh.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(sequence) = frame.sequence {
            self.stats.last_sequence.store(sequence, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn run_headless(config: &MuxConfig, plan: &RunPlan) -> Result<RunSummary> {
    let arena = HandleArena::new();
    let mut summary = run_session(config, plan, BackendKind::Headless, |spec| {
        let backend = HeadlessBackend::new(spec.name.clone(), arena.clone());
        match config.target(&spec.name).and_then(|t| t.present_interval) {
            Some(interval) => backend.with_present_interval(interval),
            None => backend,
        }
    })?;
    summary.leaked_handles = arena.live().len();
    if summary.leaked_handles > 0 {
        tracing::error!(?arena, "headless handles still live after release");
    }
    Ok(summary)
}

#[cfg(feature = "wgpu")]
fn run_wgpu(config: &MuxConfig, plan: &RunPlan) -> Result<RunSummary> {
    run_session(config, plan, BackendKind::Wgpu, |spec| {
        texmux::WgpuBackend::new(spec.name.clone())
    })
}

#[cfg(not(feature = "wgpu"))]
fn run_wgpu(_config: &MuxConfig, _plan: &RunPlan) -> Result<RunSummary> {
    bail!("camswitch was built without the `wgpu` feature")
}

fn target_specs(config: &MuxConfig) -> Vec<TargetSpec> {
    config
        .targets
        .iter()
        .map(|target| {
            let mut context = ContextConfig::default();
            if let Some(samples) = target.samples {
                context = context.with_samples(samples);
            }
            if let Some(interval) = target.swap_interval {
                context = context.with_swap_interval(interval);
            }
            TargetSpec::new(
                target.name.clone(),
                SurfaceTarget::offscreen(target.width, target.height),
            )
            .with_context(context)
        })
        .collect()
}

fn consume_policy(config: &MuxConfig) -> ConsumePolicy {
    match config.consume.policy {
        ConsumeMode::Latest => ConsumePolicy::Latest,
        ConsumeMode::Wait => ConsumePolicy::WaitForFrame {
            timeout: config.consume.wait_timeout(),
        },
    }
}

fn run_session<B, FB>(
    config: &MuxConfig,
    plan: &RunPlan,
    kind: BackendKind,
    backend: FB,
) -> Result<RunSummary>
where
    B: GraphicsBackend,
    FB: FnMut(&TargetSpec) -> B,
{
    let resource = Arc::new(GpuResource::new("camera").with_policy(consume_policy(config)));
    resource.set_default_buffer_size(config.producer.width, config.producer.height);
    let producer = Producer::spawn(Arc::clone(&resource), &config.producer)?;

    let stats: BTreeMap<String, Arc<DrawStats>> = config
        .targets
        .iter()
        .map(|target| (target.name.clone(), Arc::default()))
        .collect();
    let options = MuxOptions {
        initial: config.initial_target().map(str::to_string),
        switch_timeout: config.switch_timeout,
        ..MuxOptions::default()
    };
    let started = Instant::now();
    let mux = Multiplexer::start(
        Arc::clone(&resource),
        target_specs(config),
        options,
        backend,
        |spec| StatsRenderer {
            stats: stats.get(&spec.name).cloned().unwrap_or_default(),
        },
    )
    .context("failed to start render targets")?;

    let switches = drive(&mux, plan, started)?;

    let presented: Vec<(String, u64)> = mux
        .target_names()
        .into_iter()
        .map(|name| {
            let frames = mux.frames_presented(&name).unwrap_or(0);
            (name, frames)
        })
        .collect();
    mux.release();
    let elapsed = started.elapsed();
    let produced = producer.stop()?;
    tracing::debug!(
        frames = produced.frames_pushed,
        closed_by_consumer = produced.closed_by_consumer,
        "producer stopped"
    );

    let targets = presented
        .into_iter()
        .map(|(name, frames_presented)| {
            let draw = stats.get(&name).cloned().unwrap_or_default();
            let last = draw.last_sequence.load(Ordering::Relaxed);
            TargetSummary {
                frames_presented,
                frames_drawn: draw.drawn.load(Ordering::Relaxed),
                fresh_frames: draw.fresh.load(Ordering::Relaxed),
                last_sequence: (last > 0).then_some(last),
                name,
            }
        })
        .collect();

    Ok(RunSummary {
        backend: kind.as_str(),
        duration_ms: elapsed.as_millis() as u64,
        frames_pushed: produced.frames_pushed,
        frames_received: resource.frames_received(),
        texture_generations: resource.generations(),
        targets,
        switches,
        leaked_handles: 0,
    })
}

/// Runs until the plan's deadline, rotating the feed through every target
/// when a switch interval is set.
fn drive(mux: &Multiplexer, plan: &RunPlan, started: Instant) -> Result<Vec<SwitchSummary>> {
    let deadline = started + plan.duration;
    let names = mux.target_names();
    let mut switches = Vec::new();
    let Some(every) = plan.switch_every.filter(|_| names.len() > 1) else {
        thread::sleep(deadline.saturating_duration_since(Instant::now()));
        return Ok(switches);
    };

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        if remaining < every {
            thread::sleep(remaining);
            break;
        }
        thread::sleep(every);

        let next = match mux.active() {
            Some(active) => names
                .iter()
                .position(|name| *name == active)
                .map_or(0, |index| (index + 1) % names.len()),
            None => 0,
        };
        let report = mux
            .switch_to(&names[next])
            .with_context(|| format!("failed to switch feed to '{}'", names[next]))?;
        tracing::info!(
            from = ?report.from,
            to = %report.to,
            latency_ms = report.total().as_secs_f64() * 1000.0,
            "feed switched"
        );
        switches.push(SwitchSummary::from(&report));
    }
    Ok(switches)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Ran {} ms on the {} backend: {} frames produced, {} received, {} texture generations",
        summary.duration_ms,
        summary.backend,
        summary.frames_pushed,
        summary.frames_received,
        summary.texture_generations
    );
    println!("Targets:");
    for target in &summary.targets {
        println!(
            "  {:<16} presented={:<6} drawn={:<6} fresh={:<6} last={}",
            target.name,
            target.frames_presented,
            target.frames_drawn,
            target.fresh_frames,
            target
                .last_sequence
                .map_or_else(|| "-".to_string(), |seq| seq.to_string())
        );
    }
    if summary.switches.is_empty() {
        println!("No switches.");
        return;
    }
    println!("Switches:");
    for switch in &summary.switches {
        println!(
            "  {:>16} -> {:<16} detach={}us attach={}us",
            switch.from.as_deref().unwrap_or("(none)"),
            switch.to,
            switch.detach_us,
            switch.attach_us
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(targets: Option<usize>) -> RunArgs {
        RunArgs {
            config: None,
            targets,
            duration: Duration::from_millis(300),
            switch_every: None,
            backend: BackendKind::Headless,
            json: false,
        }
    }

    #[test]
    fn generates_targets_without_config() {
        let config = load_config(&args(Some(3))).unwrap();
        let names: Vec<_> = config.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["target-0", "target-1", "target-2"]);
        assert_eq!(config.initial_target(), Some("target-0"));
        assert!(load_config(&args(Some(0))).is_err());
    }

    #[test]
    fn maps_consume_policy() {
        let mut config = load_config(&args(None)).unwrap();
        assert_eq!(consume_policy(&config), ConsumePolicy::Latest);
        config.consume.policy = ConsumeMode::Wait;
        assert_eq!(
            consume_policy(&config),
            ConsumePolicy::WaitForFrame {
                timeout: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn headless_session_rotates_and_leaves_no_handles() {
        let config = load_config(&args(Some(2))).unwrap();
        let plan = RunPlan {
            duration: Duration::from_millis(400),
            switch_every: Some(Duration::from_millis(100)),
        };
        let summary = run_headless(&config, &plan).unwrap();
        assert_eq!(summary.leaked_handles, 0);
        assert!(!summary.switches.is_empty());
        assert_eq!(summary.switches[0].from.as_deref(), Some("target-0"));
        assert_eq!(summary.switches[0].to, "target-1");
        assert!(summary.texture_generations >= 2);
        assert!(summary.targets.iter().all(|t| t.frames_presented > 0));
    }
}
