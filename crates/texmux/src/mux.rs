use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::attach::{AttachController, AttachError};
use crate::backend::{ContextConfig, GraphicsBackend, SurfaceTarget};
use crate::feed::{FeedRenderer, FeedTarget};
use crate::resource::{ConsumeTarget, GpuResource};
use crate::thread::{RenderState, RenderThread, RenderThreadError, RenderThreadOptions};

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("no render targets configured")]
    NoTargets,
    #[error("unknown render target '{0}'")]
    UnknownTarget(String),
    #[error("render target '{0}' configured twice")]
    DuplicateTarget(String),
    #[error("failed to start render target '{target}'")]
    Start {
        target: String,
        source: RenderThreadError,
    },
    #[error("handoff on render target '{target}' failed")]
    Attach { target: String, source: AttachError },
    #[error("multiplexer already released")]
    Released,
}

/// One consumer context to start.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub name: String,
    pub surface: SurfaceTarget,
    pub context: ContextConfig,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>, surface: SurfaceTarget) -> Self {
        Self {
            name: name.into(),
            surface,
            context: ContextConfig::default(),
        }
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MuxOptions {
    /// Target that takes the feed once every thread is up.
    pub initial: Option<String>,
    /// Upper bound for each attach or detach wait; `None` waits forever.
    pub switch_timeout: Option<Duration>,
    pub consume: ConsumeTarget,
}

/// Timing of one completed handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchReport {
    pub from: Option<String>,
    pub to: String,
    pub detach: Duration,
    pub attach: Duration,
}

impl SwitchReport {
    pub fn total(&self) -> Duration {
        self.detach + self.attach
    }
}

struct Slot {
    name: String,
    controller: Arc<AttachController>,
    thread: RenderThread,
}

/// Routes one [`GpuResource`] to exactly one of several render threads.
pub struct Multiplexer {
    resource: Arc<GpuResource>,
    slots: Vec<Slot>,
    active: Mutex<Option<usize>>,
    switch_timeout: Option<Duration>,
    released: AtomicBool,
}

impl Multiplexer {
    /// Starts one render thread per target and hands the feed to
    /// `options.initial`, if set.
    ///
    /// `backend` and `renderer` are called once per target, in order.
    pub fn start<B, R, FB, FR>(
        resource: Arc<GpuResource>,
        specs: Vec<TargetSpec>,
        options: MuxOptions,
        mut backend: FB,
        mut renderer: FR,
    ) -> Result<Self, MuxError>
    where
        B: GraphicsBackend,
        R: FeedRenderer,
        FB: FnMut(&TargetSpec) -> B,
        FR: FnMut(&TargetSpec) -> R,
    {
        if specs.is_empty() {
            return Err(MuxError::NoTargets);
        }
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(MuxError::DuplicateTarget(spec.name.clone()));
            }
        }
        let initial = match &options.initial {
            Some(name) => Some(
                specs
                    .iter()
                    .position(|spec| &spec.name == name)
                    .ok_or_else(|| MuxError::UnknownTarget(name.clone()))?,
            ),
            None => None,
        };

        let mut slots = Vec::with_capacity(specs.len());
        for spec in &specs {
            let controller = Arc::new(AttachController::new());
            let target = FeedTarget::new(
                Arc::clone(&resource),
                Arc::clone(&controller),
                renderer(spec),
            )
            .consume_target(options.consume);
            let thread_options = RenderThreadOptions::new(spec.name.clone(), spec.surface.clone())
                .with_context(spec.context.clone());
            let thread = RenderThread::spawn(backend(spec), thread_options, target).map_err(
                |source| MuxError::Start {
                    target: spec.name.clone(),
                    source,
                },
            )?;
            tracing::debug!(render_target = %spec.name, "render target started");
            slots.push(Slot {
                name: spec.name.clone(),
                controller,
                thread,
            });
        }

        let mux = Self {
            resource,
            slots,
            active: Mutex::new(None),
            switch_timeout: options.switch_timeout,
            released: AtomicBool::new(false),
        };
        if let Some(index) = initial {
            let name = mux.slots[index].name.clone();
            mux.switch_to(&name)?;
        }
        Ok(mux)
    }

    /// Moves the feed to `name`: the active target detaches first, then the
    /// new target attaches. Switches are serialised.
    ///
    /// A request that times out is withdrawn: after a detach timeout the old
    /// target keeps the feed, after an attach timeout no target holds it.
    pub fn switch_to(&self, name: &str) -> Result<SwitchReport, MuxError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(MuxError::Released);
        }
        let to = self.index_of(name)?;
        let mut active = self.lock_active();
        let from = *active;
        if from == Some(to) {
            return Ok(SwitchReport {
                from: Some(name.to_string()),
                to: name.to_string(),
                detach: Duration::ZERO,
                attach: Duration::ZERO,
            });
        }

        let started = Instant::now();
        if let Some(index) = from {
            let slot = &self.slots[index];
            match self.detach(slot) {
                Ok(()) => {}
                Err(AttachError::Closed) => {
                    // The thread is shutting down and releases the feed itself.
                    tracing::warn!(
                        render_target = %slot.name,
                        "active target stopped; waiting for teardown"
                    );
                    slot.thread.wait_stopped();
                }
                Err(source) => {
                    return Err(MuxError::Attach {
                        target: slot.name.clone(),
                        source,
                    })
                }
            }
            *active = None;
        }
        let detach = started.elapsed();

        let attach_started = Instant::now();
        let slot = &self.slots[to];
        self.attach(slot).map_err(|source| MuxError::Attach {
            target: slot.name.clone(),
            source,
        })?;
        *active = Some(to);
        let report = SwitchReport {
            from: from.map(|index| self.slots[index].name.clone()),
            to: slot.name.clone(),
            detach,
            attach: attach_started.elapsed(),
        };
        tracing::debug!(
            from = ?report.from,
            to = %report.to,
            detach_us = report.detach.as_micros() as u64,
            attach_us = report.attach.as_micros() as u64,
            "feed switched"
        );
        Ok(report)
    }

    /// Detaches the active target, leaving the feed unconsumed.
    pub fn deactivate(&self) -> Result<(), MuxError> {
        let mut active = self.lock_active();
        if let Some(index) = *active {
            let slot = &self.slots[index];
            match self.detach(slot) {
                Ok(()) | Err(AttachError::Closed) => {}
                Err(source) => {
                    return Err(MuxError::Attach {
                        target: slot.name.clone(),
                        source,
                    })
                }
            }
            *active = None;
        }
        Ok(())
    }

    pub fn active(&self) -> Option<String> {
        self.lock_active()
            .map(|index| self.slots[index].name.clone())
    }

    pub fn target_names(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }

    pub fn frames_presented(&self, name: &str) -> Option<u64> {
        self.slot(name).map(|slot| slot.thread.frames_presented())
    }

    pub fn state(&self, name: &str) -> Option<RenderState> {
        self.slot(name).map(|slot| slot.thread.state())
    }

    /// Stops every render thread and destroys the resource.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let _active = self.lock_active();
        for slot in &self.slots {
            slot.thread.release();
        }
        if let Err(err) = self.resource.destroy(None) {
            tracing::warn!(
                resource = self.resource.name(),
                %err,
                "resource still attached after release"
            );
            self.resource.destroy_forced();
        }
        tracing::debug!(resource = self.resource.name(), "multiplexer released");
    }

    fn attach(&self, slot: &Slot) -> Result<(), AttachError> {
        match self.switch_timeout {
            Some(timeout) => slot.controller.request_attach_timeout(timeout),
            None => slot.controller.request_attach(),
        }
    }

    fn detach(&self, slot: &Slot) -> Result<(), AttachError> {
        match self.switch_timeout {
            Some(timeout) => slot.controller.request_detach_timeout(timeout),
            None => slot.controller.request_detach(),
        }
    }

    fn index_of(&self, name: &str) -> Result<usize, MuxError> {
        self.slots
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| MuxError::UnknownTarget(name.to_string()))
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<usize>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("resource", &self.resource.name())
            .field("targets", &self.target_names())
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{FailPoint, HandleArena, HeadlessBackend};
    use crate::resource::ConsumedFrame;
    use crate::thread::DrawContext;

    struct Quiet;

    impl FeedRenderer for Quiet {
        fn on_frame(
            &mut self,
            _ctx: &mut DrawContext<'_>,
            _frame: &ConsumedFrame,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn specs(names: &[&str]) -> Vec<TargetSpec> {
        names
            .iter()
            .map(|name| TargetSpec::new(*name, SurfaceTarget::offscreen(8, 8)))
            .collect()
    }

    fn start(
        arena: &HandleArena,
        names: &[&str],
        initial: Option<&str>,
    ) -> Result<Multiplexer, MuxError> {
        Multiplexer::start(
            Arc::new(GpuResource::new("camera")),
            specs(names),
            MuxOptions {
                initial: initial.map(str::to_string),
                switch_timeout: Some(Duration::from_secs(5)),
                ..MuxOptions::default()
            },
            |spec| HeadlessBackend::new(spec.name.clone(), arena.clone()),
            |_| Quiet,
        )
    }

    #[test]
    fn rejects_bad_target_sets() {
        let arena = HandleArena::new();
        assert!(matches!(start(&arena, &[], None), Err(MuxError::NoTargets)));
        assert!(matches!(
            start(&arena, &["a", "a"], None),
            Err(MuxError::DuplicateTarget(name)) if name == "a"
        ));
        assert!(matches!(
            start(&arena, &["a"], Some("b")),
            Err(MuxError::UnknownTarget(name)) if name == "b"
        ));
        assert!(arena.is_clean());
    }

    #[test]
    fn switching_moves_the_feed() {
        let arena = HandleArena::new();
        let mux = start(&arena, &["left", "right"], Some("left")).unwrap();
        assert_eq!(mux.active().as_deref(), Some("left"));
        assert!(mux.resource().is_attached());

        let report = mux.switch_to("right").unwrap();
        assert_eq!(report.from.as_deref(), Some("left"));
        assert_eq!(report.to, "right");
        assert_eq!(mux.active().as_deref(), Some("right"));
        assert_eq!(mux.resource().generations(), 2);

        let same = mux.switch_to("right").unwrap();
        assert_eq!(same.total(), Duration::ZERO);
        assert!(matches!(
            mux.switch_to("nowhere"),
            Err(MuxError::UnknownTarget(_))
        ));

        mux.deactivate().unwrap();
        assert_eq!(mux.active(), None);
        assert!(!mux.resource().is_attached());

        mux.release();
        assert!(mux.resource().is_destroyed());
        assert!(matches!(mux.switch_to("left"), Err(MuxError::Released)));
        assert!(arena.is_clean(), "leaked: {arena:?}");
    }

    #[test]
    fn failed_target_start_releases_started_ones() {
        let arena = HandleArena::new();
        let result = Multiplexer::start(
            Arc::new(GpuResource::new("camera")),
            specs(&["ok", "broken"]),
            MuxOptions::default(),
            |spec| {
                let backend = HeadlessBackend::new(spec.name.clone(), arena.clone());
                if spec.name == "broken" {
                    backend.with_fail_point(FailPoint::CreateSurface)
                } else {
                    backend
                }
            },
            |_| Quiet,
        );
        match result {
            Err(MuxError::Start { target, source }) => {
                assert_eq!(target, "broken");
                assert!(matches!(source, RenderThreadError::SurfaceCreationFailed(_)));
            }
            other => panic!("unexpected start result: {other:?}"),
        }
        assert!(arena.is_clean());
    }
}
