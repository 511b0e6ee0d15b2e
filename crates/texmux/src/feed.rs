use std::sync::Arc;

use anyhow::Context as _;

use crate::attach::{AttachCallback, AttachController};
use crate::backend::GpuContext;
use crate::frame::FrameError;
use crate::resource::{ConsumeTarget, ConsumedFrame, GpuResource, ResourceError};
use crate::thread::{DrawContext, RenderCallback};

/// Drawing hooks for a render thread that may hold the shared feed.
pub trait FeedRenderer: Send + 'static {
    fn on_create(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called every iteration while this thread holds the feed, after the
    /// newest frame has been bound.
    fn on_frame(&mut self, ctx: &mut DrawContext<'_>, frame: &ConsumedFrame)
        -> anyhow::Result<()>;

    /// Called every iteration while another thread holds the feed.
    fn on_idle(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_frame_error(&mut self, ctx: &mut DrawContext<'_>, error: &FrameError) {
        tracing::warn!(render_target = ctx.target(), %error, "frame producer error");
    }

    fn on_destroy(&mut self, _ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// [`RenderCallback`] that applies attach/detach requests for one render
/// thread and feeds the shared resource to a [`FeedRenderer`].
pub struct FeedTarget<R> {
    resource: Arc<GpuResource>,
    controller: Arc<AttachController>,
    renderer: R,
    start_attached: bool,
    consume: ConsumeTarget,
}

impl<R: FeedRenderer> FeedTarget<R> {
    pub fn new(resource: Arc<GpuResource>, controller: Arc<AttachController>, renderer: R) -> Self {
        Self {
            resource,
            controller,
            renderer,
            start_attached: false,
            consume: ConsumeTarget::default(),
        }
    }

    /// Takes the feed in `on_create` instead of waiting for an attach request.
    pub fn start_attached(mut self, attached: bool) -> Self {
        self.start_attached = attached;
        self
    }

    pub fn consume_target(mut self, target: ConsumeTarget) -> Self {
        self.consume = target;
        self
    }
}

struct Hooks<'a> {
    resource: &'a GpuResource,
    gpu: &'a mut dyn GpuContext,
}

impl AttachCallback for Hooks<'_> {
    type Error = ResourceError;

    fn on_attach(&mut self) -> Result<(), ResourceError> {
        self.resource.attach_or_create(&mut *self.gpu).map(|_| ())
    }

    fn on_detach(&mut self) -> Result<(), ResourceError> {
        self.resource.detach(&mut *self.gpu)
    }
}

fn escalate(err: ResourceError, ctx: &DrawContext<'_>, what: &str) -> anyhow::Result<()> {
    if err.is_invariant_violation() {
        tracing::error!(render_target = ctx.target(), %err, "{what} violated resource ownership");
        return Err(err).with_context(|| format!("{what} on '{}'", ctx.target()));
    }
    tracing::warn!(render_target = ctx.target(), %err, "{what} failed");
    Ok(())
}

impl<R: FeedRenderer> RenderCallback for FeedTarget<R> {
    fn on_create(&mut self, ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        if self.start_attached {
            self.resource
                .attach_or_create(ctx.gpu())
                .with_context(|| format!("taking the feed on '{}'", ctx.target()))?;
            self.controller.mark_attached(true);
        }
        self.renderer.on_create(ctx)
    }

    fn on_draw(&mut self, ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        let applied = {
            let mut hooks = Hooks {
                resource: &self.resource,
                gpu: ctx.gpu(),
            };
            self.controller.apply_pending(&mut hooks)
        };
        if let Err(err) = applied {
            escalate(err, ctx, "attach request")?;
        }

        if !self.controller.is_attached() {
            return self.renderer.on_idle(ctx);
        }

        for error in self.resource.take_errors() {
            self.renderer.on_frame_error(ctx, &error);
        }
        match self.resource.consume(ctx.gpu(), &self.consume) {
            Ok(frame) => self.renderer.on_frame(ctx, &frame),
            Err(err) => escalate(err, ctx, "consume"),
        }
    }

    fn on_destroy(&mut self, ctx: &mut DrawContext<'_>) -> anyhow::Result<()> {
        let result = self.renderer.on_destroy(ctx);
        self.controller.close();
        if self.resource.is_owned_by_current_thread() {
            if let Err(err) = self.resource.detach(ctx.gpu()) {
                tracing::warn!(
                    render_target = ctx.target(),
                    %err,
                    "failed to release feed on teardown"
                );
            }
        }
        self.controller.mark_attached(false);
        result
    }
}
