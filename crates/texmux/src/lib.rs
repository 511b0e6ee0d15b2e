//! Multiplexes one live frame stream across several render threads.
//!
//! Every render thread owns a graphics context; the producer-backed
//! [`GpuResource`] is bound to at most one of them at a time. Switching the
//! consumer is a detach on the active thread followed by an attach on the
//! new one, each applied by the owning thread at the top of its frame loop:
//!
//! ```text
//!   producer ──▶ FrameSink ──▶ GpuResource (latest frame + transform)
//!                                   │
//!   Multiplexer::switch_to          │ texture handle lives on one thread
//!     │ request_detach ─▶ RenderThread A: apply_pending ─▶ detach
//!     │ request_attach ─▶ RenderThread B: apply_pending ─▶ attach ─▶ consume
//!     ▼                                                        │
//!   SwitchReport                          on_draw ─▶ swap_buffers
//! ```
//!
//! Synchronisation is built from three primitives: [`BlockingFuture`] for
//! every cross-thread handshake, [`ThreadAffinityGuard`] to reject
//! thread-bound handle access from the wrong thread, and
//! [`AttachController`] to coalesce requests. Graphics APIs plug in through
//! [`GraphicsBackend`]; the crate ships a headless backend with a leak-checking
//! handle arena and, behind the default `wgpu` feature, a wgpu backend.

pub mod affinity;
pub mod attach;
pub mod backend;
pub mod feed;
pub mod frame;
pub mod future;
pub mod mux;
pub mod resource;
pub mod thread;

pub use affinity::{AffinityError, ThreadAffinityGuard};
pub use attach::{AttachCallback, AttachController, AttachError, Intent};
pub use backend::headless::{FailPoint, HandleArena, HandleKind, HeadlessBackend};
#[cfg(feature = "wgpu")]
pub use backend::wgpu::WgpuBackend;
pub use backend::{
    ContextConfig, GpuContext, GraphicsBackend, GraphicsError, SurfaceTarget, TextureId,
    WindowTarget,
};
pub use feed::{FeedRenderer, FeedTarget};
pub use frame::{Frame, FrameError, Transform};
pub use future::{BlockingFuture, FutureError};
pub use mux::{MuxError, MuxOptions, Multiplexer, SwitchReport, TargetSpec};
pub use resource::{
    ConsumePolicy, ConsumeTarget, ConsumedFrame, FrameSink, GpuResource, ResourceError,
};
pub use thread::{
    DrawContext, RenderCallback, RenderState, RenderThread, RenderThreadError,
    RenderThreadOptions,
};
