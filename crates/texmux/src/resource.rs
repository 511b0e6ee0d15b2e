//! Producer-backed texture whose handle migrates between render threads.
//!
//! The producer side ([`FrameSink`]) is created once and survives every
//! migration; only the texture handle is thread-bound. A handoff looks like:
//!
//! ```text
//!   thread A: create ── consume* ── detach ─┐
//!                                           │ latest frame + transform kept
//!   thread B:                               └── attach ── consume* ── detach
//! ```
//!
//! At most one thread holds a live handle at any time; the
//! [`ThreadAffinityGuard`] rejects every handle operation from anywhere else.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::affinity::{AffinityError, ThreadAffinityGuard};
use crate::backend::{GpuContext, GraphicsError, TextureId};
use crate::frame::{Frame, FrameError, Transform};
use crate::future::BlockingFuture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource already created")]
    AlreadyCreated,
    #[error("resource has not been created")]
    NotCreated,
    #[error("resource is already attached to a context")]
    AlreadyAttached,
    #[error("resource is not attached to a context")]
    NotAttached,
    #[error("resource has been destroyed")]
    Destroyed,
    #[error("a live texture handle can only be released with its owning context")]
    ContextRequired,
    #[error(transparent)]
    Affinity(#[from] AffinityError),
    #[error(transparent)]
    Graphics(#[from] GraphicsError),
}

impl ResourceError {
    /// True for errors that mean the calling code is wrong rather than the
    /// environment.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ResourceError::AlreadyCreated | ResourceError::Affinity(_))
    }
}

/// How [`GpuResource::consume`] behaves when no new frame has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumePolicy {
    /// Never block; re-bind the last latched frame.
    #[default]
    Latest,
    /// Block up to `timeout` for a new frame, then fall back to `Latest`.
    WaitForFrame { timeout: Duration },
}

/// Where a consumed frame is bound in the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeTarget {
    pub texture_unit: u32,
    pub transform_binding: u32,
}

/// Result of one [`GpuResource::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumedFrame {
    pub texture: TextureId,
    /// Sequence of the frame currently latched into `texture`, if any.
    pub sequence: Option<u64>,
    pub transform: Transform,
    /// Whether a new frame was latched by this call.
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Absent,
    Bound { texture: TextureId },
    Detached,
    Destroyed,
}

struct HandleState {
    lifecycle: Lifecycle,
    default_size: Option<(u32, u32)>,
    latched: Option<u64>,
    generations: u64,
}

#[derive(Default)]
struct FrameSlot {
    latest: Option<Frame>,
    transform: Transform,
    available: bool,
    closed: bool,
    received: u64,
    errors: Vec<FrameError>,
}

#[derive(Default)]
struct Feed {
    slot: Mutex<FrameSlot>,
    arrived: Condvar,
}

impl Feed {
    fn lock(&self) -> MutexGuard<'_, FrameSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer handle for a [`GpuResource`].
///
/// Cheap to clone; every clone feeds the same resource. Once the resource is
/// destroyed all calls fail with [`FrameError::Closed`].
#[derive(Clone)]
pub struct FrameSink {
    resource: Arc<str>,
    feed: Arc<Feed>,
}

impl FrameSink {
    /// Publishes `frame` as the latest frame and wakes waiting consumers.
    pub fn push(&self, frame: Frame) -> Result<(), FrameError> {
        frame.validate()?;
        let mut slot = self.feed.lock();
        if slot.closed {
            return Err(FrameError::Closed);
        }
        slot.transform = frame.transform;
        slot.latest = Some(frame);
        slot.available = true;
        slot.received += 1;
        drop(slot);
        self.feed.arrived.notify_all();
        Ok(())
    }

    /// Queues a producer failure for the consuming side's error callback.
    pub fn report_error(&self, error: FrameError) -> Result<(), FrameError> {
        let mut slot = self.feed.lock();
        if slot.closed {
            return Err(FrameError::Closed);
        }
        tracing::warn!(resource = %self.resource, %error, "frame producer reported an error");
        slot.errors.push(error);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.feed.lock().closed
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("resource", &self.resource)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A texture fed by an external frame producer.
pub struct GpuResource {
    name: Arc<str>,
    affinity: ThreadAffinityGuard,
    state: Mutex<HandleState>,
    feed: Arc<Feed>,
    sink_ready: BlockingFuture<FrameSink, FrameError>,
    policy: ConsumePolicy,
}

impl GpuResource {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            affinity: ThreadAffinityGuard::new(format!("resource '{name}'")),
            name: name.into(),
            state: Mutex::new(HandleState {
                lifecycle: Lifecycle::Absent,
                default_size: None,
                latched: None,
                generations: 0,
            }),
            feed: Arc::new(Feed::default()),
            sink_ready: BlockingFuture::new(),
            policy: ConsumePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConsumePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ConsumePolicy {
        self.policy
    }

    /// Allocates the first texture handle on the calling thread and opens the
    /// producer side.
    pub fn create(&self, ctx: &mut dyn GpuContext) -> Result<TextureId, ResourceError> {
        let mut state = self.lock_state();
        match state.lifecycle {
            Lifecycle::Absent => {}
            Lifecycle::Destroyed => return Err(ResourceError::Destroyed),
            Lifecycle::Bound { .. } | Lifecycle::Detached => {
                tracing::error!(resource = %self.name, "create called on an existing resource");
                return Err(ResourceError::AlreadyCreated);
            }
        }
        let texture = self.allocate(&mut state, ctx)?;

        let sink = FrameSink {
            resource: Arc::clone(&self.name),
            feed: Arc::clone(&self.feed),
        };
        let _ = self.sink_ready.set(sink);
        tracing::debug!(resource = %self.name, context = ctx.label(), %texture, "resource created");
        Ok(texture)
    }

    /// Allocates a fresh handle on the calling thread after a detach.
    ///
    /// The latest frame is re-latched on the next consume, so the new owner
    /// starts from the producer's current image rather than an empty texture.
    pub fn attach(&self, ctx: &mut dyn GpuContext) -> Result<TextureId, ResourceError> {
        let mut state = self.lock_state();
        match state.lifecycle {
            Lifecycle::Detached => {}
            Lifecycle::Absent => return Err(ResourceError::NotCreated),
            Lifecycle::Bound { .. } => return Err(ResourceError::AlreadyAttached),
            Lifecycle::Destroyed => return Err(ResourceError::Destroyed),
        }
        let texture = self.allocate(&mut state, ctx)?;

        let mut slot = self.feed.lock();
        slot.available = slot.latest.is_some();
        drop(slot);
        tracing::debug!(
            resource = %self.name,
            context = ctx.label(),
            %texture,
            "resource attached"
        );
        Ok(texture)
    }

    /// [`create`](Self::create) on first use, [`attach`](Self::attach) after.
    pub fn attach_or_create(&self, ctx: &mut dyn GpuContext) -> Result<TextureId, ResourceError> {
        if self.is_created() {
            self.attach(ctx)
        } else {
            self.create(ctx)
        }
    }

    /// Releases the texture handle held by the calling thread. Producer-side
    /// state is kept for the next owner.
    pub fn detach(&self, ctx: &mut dyn GpuContext) -> Result<(), ResourceError> {
        let mut state = self.lock_state();
        let texture = match state.lifecycle {
            Lifecycle::Bound { texture } => texture,
            Lifecycle::Absent => return Err(ResourceError::NotCreated),
            Lifecycle::Detached => return Err(ResourceError::NotAttached),
            Lifecycle::Destroyed => return Err(ResourceError::Destroyed),
        };
        self.affinity.check()?;
        self.release_texture(ctx, texture);
        self.affinity.deinit()?;
        state.lifecycle = Lifecycle::Detached;
        state.latched = None;
        tracing::debug!(
            resource = %self.name,
            context = ctx.label(),
            %texture,
            "resource detached"
        );
        Ok(())
    }

    /// Latches the newest frame if one arrived, binds the texture to
    /// `target.texture_unit` and feeds the frame transform.
    pub fn consume(
        &self,
        ctx: &mut dyn GpuContext,
        target: &ConsumeTarget,
    ) -> Result<ConsumedFrame, ResourceError> {
        self.affinity.check()?;
        let texture = self.bound_texture()?;

        if let ConsumePolicy::WaitForFrame { timeout } = self.policy {
            self.wait_for_frame(timeout);
        }

        let (frame, transform) = {
            let mut slot = self.feed.lock();
            let frame = if slot.available {
                slot.available = false;
                slot.latest.clone()
            } else {
                None
            };
            (frame, slot.transform)
        };

        let fresh = frame.is_some();
        if let Some(frame) = &frame {
            ctx.upload_frame(texture, frame)?;
            self.lock_state().latched = Some(frame.sequence);
        }
        ctx.bind_texture(target.texture_unit, texture)?;
        ctx.set_transform(target.transform_binding, &transform)?;

        Ok(ConsumedFrame {
            texture,
            sequence: self.lock_state().latched,
            transform,
            fresh,
        })
    }

    /// Stops notifications, releases the handle and then the producer side.
    ///
    /// A live handle must be released on its owning thread with its context.
    /// Calling this again after success is a no-op.
    pub fn destroy(&self, ctx: Option<&mut dyn GpuContext>) -> Result<(), ResourceError> {
        let mut state = self.lock_state();
        let bound = match state.lifecycle {
            Lifecycle::Destroyed => return Ok(()),
            Lifecycle::Bound { texture } => {
                self.affinity.check()?;
                Some(texture)
            }
            Lifecycle::Absent | Lifecycle::Detached => None,
        };
        let ctx = match (bound, ctx) {
            (Some(_), None) => return Err(ResourceError::ContextRequired),
            (_, ctx) => ctx,
        };

        self.close_feed();
        if let (Some(texture), Some(ctx)) = (bound, ctx) {
            self.release_texture(ctx, texture);
            self.affinity.deinit()?;
        }
        self.release_producer();
        state.lifecycle = Lifecycle::Destroyed;
        state.latched = None;
        tracing::debug!(resource = %self.name, "resource destroyed");
        Ok(())
    }

    /// Destroys the resource without touching the texture handle. Used when
    /// the owning thread is already gone; the handle is reclaimed when its
    /// context is torn down.
    pub fn destroy_forced(&self) {
        let mut state = self.lock_state();
        if state.lifecycle == Lifecycle::Destroyed {
            return;
        }
        if let Lifecycle::Bound { texture } = state.lifecycle {
            tracing::warn!(
                resource = %self.name,
                %texture,
                "forced destroy abandons texture to its context"
            );
        }
        self.close_feed();
        self.affinity.force_clear();
        self.release_producer();
        state.lifecycle = Lifecycle::Destroyed;
        state.latched = None;
    }

    /// Blocks until the resource has been created and returns the producer
    /// handle. Fails with [`FrameError::Closed`] if it is destroyed first.
    pub fn sink(&self) -> Result<FrameSink, FrameError> {
        self.sink_ready.get()
    }

    pub fn sink_timeout(&self, timeout: Duration) -> Option<Result<FrameSink, FrameError>> {
        self.sink_ready.get_timeout(timeout)
    }

    pub fn try_sink(&self) -> Option<FrameSink> {
        self.sink_ready.try_get().and_then(Result::ok)
    }

    /// Size given to handles allocated from now on. Frames of a different
    /// size still resize the texture when latched.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) {
        self.lock_state().default_size = Some((width, height));
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.affinity.is_current()
    }

    /// Handle held by the owning thread, or `None` while detached.
    pub fn texture(&self) -> Option<TextureId> {
        match self.lock_state().lifecycle {
            Lifecycle::Bound { texture } => Some(texture),
            _ => None,
        }
    }

    /// Transform of the most recent frame, kept across migrations.
    pub fn transform(&self) -> Transform {
        self.feed.lock().transform
    }

    pub fn take_errors(&self) -> Vec<FrameError> {
        std::mem::take(&mut self.feed.lock().errors)
    }

    pub fn frames_received(&self) -> u64 {
        self.feed.lock().received
    }

    /// Number of texture handles allocated over the resource's lifetime.
    pub fn generations(&self) -> u64 {
        self.lock_state().generations
    }

    pub fn is_created(&self) -> bool {
        matches!(
            self.lock_state().lifecycle,
            Lifecycle::Bound { .. } | Lifecycle::Detached
        )
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.lock_state().lifecycle, Lifecycle::Bound { .. })
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_state().lifecycle == Lifecycle::Destroyed
    }

    fn allocate(
        &self,
        state: &mut HandleState,
        ctx: &mut dyn GpuContext,
    ) -> Result<TextureId, ResourceError> {
        self.affinity.init().inspect_err(|err| {
            tracing::error!(resource = %self.name, %err, "texture handle bound twice");
        })?;
        let texture = match ctx.create_external_texture(state.default_size) {
            Ok(texture) => texture,
            Err(err) => {
                self.affinity.force_clear();
                return Err(err.into());
            }
        };
        state.lifecycle = Lifecycle::Bound { texture };
        state.latched = None;
        state.generations += 1;
        Ok(texture)
    }

    fn release_texture(&self, ctx: &mut dyn GpuContext, texture: TextureId) {
        if let Err(err) = ctx.delete_texture(texture) {
            tracing::warn!(resource = %self.name, %texture, %err, "failed to delete texture");
        }
    }

    fn bound_texture(&self) -> Result<TextureId, ResourceError> {
        match self.lock_state().lifecycle {
            Lifecycle::Bound { texture } => Ok(texture),
            Lifecycle::Absent => Err(ResourceError::NotCreated),
            Lifecycle::Detached => Err(ResourceError::NotAttached),
            Lifecycle::Destroyed => Err(ResourceError::Destroyed),
        }
    }

    fn wait_for_frame(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut slot = self.feed.lock();
        while !slot.available && !slot.closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            slot = self
                .feed
                .arrived
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close_feed(&self) {
        self.feed.lock().closed = true;
        self.feed.arrived.notify_all();
    }

    fn release_producer(&self) {
        let mut slot = self.feed.lock();
        slot.latest = None;
        slot.available = false;
        drop(slot);
        let _ = self.sink_ready.set_error(FrameError::Closed);
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("GpuResource")
            .field("name", &self.name)
            .field("lifecycle", &state.lifecycle)
            .field("generations", &state.generations)
            .field("policy", &self.policy)
            .finish()
    }
}
