use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::backend::{ContextConfig, GpuContext, GraphicsBackend, GraphicsError, SurfaceTarget};
use crate::future::BlockingFuture;

/// Failure to bring a render thread up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderThreadError {
    #[error("failed to spawn render thread: {0}")]
    Spawn(String),
    #[error("invalid context configuration: {0}")]
    InvalidConfig(GraphicsError),
    #[error("display unavailable: {0}")]
    DisplayUnavailable(GraphicsError),
    #[error("context creation failed: {0}")]
    ContextCreationFailed(GraphicsError),
    #[error("surface creation failed: {0}")]
    SurfaceCreationFailed(GraphicsError),
    #[error("failed to make context current: {0}")]
    MakeCurrentFailed(GraphicsError),
    #[error("render thread exited before signalling readiness")]
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Starting,
    Running,
    Destroying,
    Stopped,
}

/// Consumer hooks run on the render thread.
///
/// Callbacks must return promptly; blocking inside one stalls the frame loop
/// and any attach or detach request waiting on it.
pub trait RenderCallback: Send + 'static {
    fn on_create(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per loop iteration before the frame is presented. An error
    /// stops the loop and tears the thread down.
    fn on_draw(&mut self, ctx: &mut DrawContext<'_>) -> anyhow::Result<()>;

    fn on_destroy(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-call view of the render thread handed to a [`RenderCallback`].
pub struct DrawContext<'a> {
    gpu: &'a mut dyn GpuContext,
    target: &'a str,
    frame_index: u64,
    surface_size: (u32, u32),
    stop: &'a AtomicBool,
}

impl<'a> DrawContext<'a> {
    pub fn gpu(&mut self) -> &mut dyn GpuContext {
        &mut *self.gpu
    }

    pub fn target(&self) -> &str {
        self.target
    }

    /// Number of frames presented before this call.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    /// Asks the loop to stop after the current iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RenderThreadOptions {
    pub name: String,
    pub surface: SurfaceTarget,
    pub context: ContextConfig,
}

impl RenderThreadOptions {
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

struct Shared {
    name: String,
    stop: AtomicBool,
    state: Mutex<RenderState>,
    frames: AtomicU64,
    stopped: BlockingFuture<()>,
    thread: OnceLock<ThreadId>,
}

impl Shared {
    fn set_state(&self, state: RenderState) {
        *self.lock_state() = state;
        tracing::debug!(render_target = %self.name, ?state, "render thread state");
    }

    fn lock_state(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A dedicated OS thread owning one graphics context and surface.
///
/// [`spawn`](Self::spawn) returns once the context is current on the new
/// thread (or reports why it could not be made so); [`release`](Self::release)
/// returns once every graphics object has been torn down.
pub struct RenderThread {
    shared: Arc<Shared>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RenderThread {
    pub fn spawn<B, C>(
        backend: B,
        options: RenderThreadOptions,
        callback: C,
    ) -> Result<Self, RenderThreadError>
    where
        B: GraphicsBackend,
        C: RenderCallback,
    {
        options
            .context
            .validate()
            .map_err(RenderThreadError::InvalidConfig)?;

        let shared = Arc::new(Shared {
            name: options.name.clone(),
            stop: AtomicBool::new(false),
            state: Mutex::new(RenderState::Starting),
            frames: AtomicU64::new(0),
            stopped: BlockingFuture::new(),
            thread: OnceLock::new(),
        });
        let created: Arc<BlockingFuture<(), RenderThreadError>> = Arc::new(BlockingFuture::new());

        let handle = {
            let shared = Arc::clone(&shared);
            let created = Arc::clone(&created);
            thread::Builder::new()
                .name(format!("texmux-{}", options.name))
                .spawn(move || run_render_thread(shared, created, backend, options, callback))
                .map_err(|err| RenderThreadError::Spawn(err.to_string()))?
        };

        if let Err(err) = created.get() {
            if handle.join().is_err() {
                tracing::error!(
                    render_target = %shared.name,
                    "render thread panicked during start-up"
                );
            }
            return Err(err);
        }

        Ok(Self {
            shared,
            join_handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops the frame loop and blocks until teardown has finished.
    ///
    /// Safe to call from several threads at once and more than once. Called
    /// from the render thread itself it only requests the stop.
    pub fn release(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if self.is_render_thread() {
            tracing::debug!(
                render_target = %self.shared.name,
                "release requested from render thread"
            );
            return;
        }
        self.shared.stopped.wait();
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(render_target = %self.shared.name, "render thread panicked");
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> RenderState {
        *self.shared.lock_state()
    }

    pub fn frames_presented(&self) -> u64 {
        self.shared.frames.load(Ordering::SeqCst)
    }

    pub fn is_render_thread(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    /// Blocks until the thread has stopped on its own, without asking it to.
    pub fn wait_stopped(&self) {
        self.shared.stopped.wait();
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for RenderThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderThread")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("frames", &self.frames_presented())
            .finish()
    }
}

/// Marks the thread stopped however `run_render_thread` exits, panics included.
struct StopGuard {
    shared: Arc<Shared>,
    created: Arc<BlockingFuture<(), RenderThreadError>>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(render_target = %self.shared.name, "render thread unwinding");
        }
        let _ = self.created.set_error(RenderThreadError::Vanished);
        self.shared.set_state(RenderState::Stopped);
        let _ = self.shared.stopped.set(());
    }
}

/// Graphics objects owned by a render thread, released in reverse order of
/// acquisition.
struct Session<B: GraphicsBackend> {
    backend: B,
    label: String,
    display: Option<B::Display>,
    context: Option<B::Context>,
    surface: Option<B::Surface>,
}

impl<B: GraphicsBackend> Session<B> {
    fn new(backend: B, label: String) -> Self {
        Self {
            backend,
            label,
            display: None,
            context: None,
            surface: None,
        }
    }

    fn open(&mut self, options: &RenderThreadOptions) -> Result<(), RenderThreadError> {
        let display = self
            .backend
            .open_display()
            .map_err(RenderThreadError::DisplayUnavailable)?;
        let display = self.display.insert(display);
        let context = self
            .backend
            .create_context(display, &options.context)
            .map_err(RenderThreadError::ContextCreationFailed)?;
        let context = self.context.insert(context);
        let surface = self
            .backend
            .create_surface(display, context, &options.surface)
            .map_err(RenderThreadError::SurfaceCreationFailed)?;
        let surface = self.surface.insert(surface);
        self.backend
            .make_current(display, context, surface)
            .map_err(RenderThreadError::MakeCurrentFailed)?;
        tracing::debug!(
            render_target = %self.label,
            backend = self.backend.name(),
            "graphics context ready"
        );
        Ok(())
    }

    fn gpu(&mut self) -> Option<&mut B::Context> {
        self.context.as_mut()
    }

    fn present(&mut self) -> Result<(), GraphicsError> {
        match (
            self.display.as_ref(),
            self.context.as_mut(),
            self.surface.as_mut(),
        ) {
            (Some(display), Some(context), Some(surface)) => {
                self.backend.swap_buffers(display, context, surface)
            }
            _ => Err(GraphicsError::Present(format!(
                "{}: session is not open",
                self.label
            ))),
        }
    }

    /// Every step is attempted even if an earlier one fails.
    fn teardown(&mut self) {
        if let Some(display) = self.display.as_ref() {
            if let Some(surface) = self.surface.take() {
                if let Err(err) = self.backend.destroy_surface(display, surface) {
                    tracing::warn!(render_target = %self.label, %err, "failed to destroy surface");
                }
            }
            if let Some(context) = self.context.take() {
                if let Err(err) = self.backend.destroy_context(display, context) {
                    tracing::warn!(render_target = %self.label, %err, "failed to destroy context");
                }
            }
        }
        if let Some(display) = self.display.take() {
            if let Err(err) = self.backend.terminate_display(display) {
                tracing::warn!(render_target = %self.label, %err, "failed to terminate display");
            }
        }
    }
}

impl<B: GraphicsBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn run_render_thread<B, C>(
    shared: Arc<Shared>,
    created: Arc<BlockingFuture<(), RenderThreadError>>,
    backend: B,
    options: RenderThreadOptions,
    mut callback: C,
) where
    B: GraphicsBackend,
    C: RenderCallback,
{
    let _ = shared.thread.set(thread::current().id());
    let _guard = StopGuard {
        shared: Arc::clone(&shared),
        created: Arc::clone(&created),
    };
    let mut session = Session::new(backend, options.name.clone());

    if let Err(err) = session.open(&options) {
        tracing::warn!(render_target = %shared.name, %err, "render thread failed to start");
        session.teardown();
        let _ = created.set_error(err);
        return;
    }
    shared.set_state(RenderState::Running);
    let _ = created.set(());

    let surface_size = options.surface.size();
    let mut frame_index = 0u64;

    let created_ok = match session.gpu() {
        Some(gpu) => {
            let mut ctx = DrawContext {
                gpu,
                target: &shared.name,
                frame_index,
                surface_size,
                stop: &shared.stop,
            };
            callback.on_create(&mut ctx)
        }
        None => Ok(()),
    };
    if let Err(err) = created_ok {
        tracing::error!(
            render_target = %shared.name,
            error = %format!("{err:#}"),
            "on_create failed"
        );
        shared.stop.store(true, Ordering::SeqCst);
    }

    while !shared.stop.load(Ordering::SeqCst) {
        let Some(gpu) = session.gpu() else {
            break;
        };
        let mut ctx = DrawContext {
            gpu,
            target: &shared.name,
            frame_index,
            surface_size,
            stop: &shared.stop,
        };
        if let Err(err) = callback.on_draw(&mut ctx) {
            tracing::error!(
                render_target = %shared.name,
                frame = frame_index,
                error = %format!("{err:#}"),
                "on_draw failed; stopping"
            );
            break;
        }
        if let Err(err) = session.present() {
            tracing::error!(
                render_target = %shared.name,
                frame = frame_index,
                %err,
                "present failed; stopping"
            );
            break;
        }
        frame_index += 1;
        shared.frames.store(frame_index, Ordering::SeqCst);
    }

    shared.set_state(RenderState::Destroying);
    if let Some(gpu) = session.gpu() {
        let mut ctx = DrawContext {
            gpu,
            target: &shared.name,
            frame_index,
            surface_size,
            stop: &shared.stop,
        };
        if let Err(err) = callback.on_destroy(&mut ctx) {
            tracing::warn!(
                render_target = %shared.name,
                error = %format!("{err:#}"),
                "on_destroy failed"
            );
        }
    }
    session.teardown();
    tracing::debug!(render_target = %shared.name, frames = frame_index, "render thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{FailPoint, HandleArena, HeadlessBackend};
    use std::time::Duration;

    struct Counter {
        draws: Arc<AtomicU64>,
        destroyed: Arc<AtomicBool>,
        stop_after: Option<u64>,
    }

    impl RenderCallback for Counter {
        fn on_draw(&mut self, ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
            self.draws.fetch_add(1, Ordering::SeqCst);
            if Some(ctx.frame_index()) == self.stop_after {
                ctx.request_stop();
            }
            Ok(())
        }

        fn on_destroy(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(stop_after: Option<u64>) -> (Counter, Arc<AtomicU64>, Arc<AtomicBool>) {
        let draws = Arc::new(AtomicU64::new(0));
        let destroyed = Arc::new(AtomicBool::new(false));
        (
            Counter {
                draws: Arc::clone(&draws),
                destroyed: Arc::clone(&destroyed),
                stop_after,
            },
            draws,
            destroyed,
        )
    }

    fn options(name: &str) -> RenderThreadOptions {
        RenderThreadOptions::new(name, SurfaceTarget::offscreen(16, 16))
    }

    #[test]
    fn spawn_runs_loop_until_release() {
        let arena = HandleArena::new();
        let backend = HeadlessBackend::new("loop", arena.clone())
            .with_present_interval(Duration::from_millis(1));
        let (callback, draws, destroyed) = counter(None);
        let thread = RenderThread::spawn(backend, options("loop"), callback).unwrap();
        assert_eq!(thread.state(), RenderState::Running);
        assert!(!thread.is_render_thread());

        while draws.load(Ordering::SeqCst) < 3 {
            thread::yield_now();
        }
        thread.release();
        assert_eq!(thread.state(), RenderState::Stopped);
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(thread.frames_presented() >= 2);
        assert!(arena.is_clean(), "leaked: {arena:?}");
    }

    #[test]
    fn make_current_failure_fails_spawn() {
        let arena = HandleArena::new();
        let backend =
            HeadlessBackend::new("mc", arena.clone()).with_fail_point(FailPoint::MakeCurrent);
        let (callback, draws, _) = counter(None);
        let err = RenderThread::spawn(backend, options("mc"), callback).unwrap_err();
        assert!(matches!(err, RenderThreadError::MakeCurrentFailed(_)));
        assert_eq!(draws.load(Ordering::SeqCst), 0);
        assert!(arena.is_clean());
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let backend = HeadlessBackend::new("cfg", HandleArena::new());
        let (callback, _, _) = counter(None);
        let options = options("cfg").with_context(ContextConfig::new().with_depth_bits(99));
        assert!(matches!(
            RenderThread::spawn(backend, options, callback),
            Err(RenderThreadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn callback_can_stop_the_loop() {
        let arena = HandleArena::new();
        let backend = HeadlessBackend::new("self-stop", arena.clone());
        let (callback, draws, destroyed) = counter(Some(4));
        let thread = RenderThread::spawn(backend, options("self-stop"), callback).unwrap();
        thread.wait_stopped();
        assert_eq!(draws.load(Ordering::SeqCst), 5);
        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(thread.frames_presented(), 5);
        drop(thread);
        assert!(arena.is_clean());
    }

    #[test]
    fn present_failure_stops_and_tears_down() {
        let arena = HandleArena::new();
        let backend = HeadlessBackend::new("swap", arena.clone())
            .with_fail_point(FailPoint::Swap { after: 2 });
        let (callback, _, destroyed) = counter(None);
        let thread = RenderThread::spawn(backend, options("swap"), callback).unwrap();
        thread.wait_stopped();
        assert_eq!(thread.frames_presented(), 2);
        assert!(destroyed.load(Ordering::SeqCst));
        assert!(arena.is_clean());
    }
}
