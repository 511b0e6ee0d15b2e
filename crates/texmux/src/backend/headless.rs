//! Software backend with no GPU behind it.
//!
//! Every display, context, surface and texture is a numbered handle recorded
//! in a shared [`HandleArena`]. Tests own the arena and assert it is empty
//! once all render threads are released; fault injection through
//! [`FailPoint`] drives the error paths of the render-thread lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    ContextConfig, GpuContext, GraphicsBackend, GraphicsError, SurfaceTarget, TextureId,
};
use crate::frame::{Frame, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleKind {
    Display,
    Context,
    Surface,
    Texture,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Display => "display",
            HandleKind::Context => "context",
            HandleKind::Surface => "surface",
            HandleKind::Texture => "texture",
        };
        f.write_str(name)
    }
}

/// A handle that has been allocated and not yet released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHandle {
    pub id: u64,
    pub kind: HandleKind,
    pub owner: String,
}

#[derive(Default)]
struct ArenaState {
    next: u64,
    live: BTreeMap<u64, (HandleKind, String)>,
    created: HashMap<HandleKind, u64>,
}

/// Registry of live headless handles, shared by every backend built on it.
///
/// Ids are unique across all kinds and never reused, so a texture recreated
/// on another context always gets a fresh id.
#[derive(Clone, Default)]
pub struct HandleArena {
    inner: Arc<Mutex<ArenaState>>,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, kind: HandleKind, owner: &str) -> u64 {
        let mut state = self.lock();
        state.next += 1;
        let id = state.next;
        state.live.insert(id, (kind, owner.to_string()));
        *state.created.entry(kind).or_default() += 1;
        tracing::trace!(id, %kind, owner, "handle allocated");
        id
    }

    pub fn release(&self, kind: HandleKind, id: u64) -> Result<(), GraphicsError> {
        let mut state = self.lock();
        match state.live.get(&id) {
            Some((live_kind, _)) if *live_kind == kind => {
                state.live.remove(&id);
                tracing::trace!(id, %kind, "handle released");
                Ok(())
            }
            _ => Err(GraphicsError::Teardown(format!(
                "{kind} handle {id} is not live"
            ))),
        }
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.lock().live.contains_key(&id)
    }

    pub fn live(&self) -> Vec<LiveHandle> {
        self.lock()
            .live
            .iter()
            .map(|(id, (kind, owner))| LiveHandle {
                id: *id,
                kind: *kind,
                owner: owner.clone(),
            })
            .collect()
    }

    pub fn live_count(&self, kind: HandleKind) -> usize {
        self.lock()
            .live
            .values()
            .filter(|(live_kind, _)| *live_kind == kind)
            .count()
    }

    /// Number of handles of `kind` ever allocated.
    pub fn total_created(&self, kind: HandleKind) -> u64 {
        self.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_clean(&self) -> bool {
        self.lock().live.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HandleArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.live()).finish()
    }
}

/// Step at which a [`HeadlessBackend`] reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    OpenDisplay,
    CreateContext,
    CreateSurface,
    MakeCurrent,
    /// Fails every swap once `after` swaps have succeeded.
    Swap { after: u64 },
    DestroySurface,
    DestroyContext,
    TerminateDisplay,
    CreateTexture,
}

pub struct HeadlessDisplay {
    id: u64,
}

pub struct HeadlessSurface {
    id: u64,
    size: (u32, u32),
    presented: u64,
}

impl HeadlessSurface {
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

#[derive(Debug, Clone, Copy)]
struct TextureSlot {
    size: Option<(u32, u32)>,
    latched: Option<u64>,
}

pub struct HeadlessContext {
    id: u64,
    label: String,
    arena: HandleArena,
    fail_textures: bool,
    current: bool,
    textures: HashMap<TextureId, TextureSlot>,
    bound: HashMap<u32, TextureId>,
    transforms: HashMap<u32, Transform>,
    uploads: u64,
}

impl HeadlessContext {
    /// Sequence number of the frame last latched into `texture`.
    pub fn latched_sequence(&self, texture: TextureId) -> Option<u64> {
        self.textures.get(&texture).and_then(|slot| slot.latched)
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture).and_then(|slot| slot.size)
    }

    pub fn bound_texture(&self, unit: u32) -> Option<TextureId> {
        self.bound.get(&unit).copied()
    }

    pub fn transform(&self, binding: u32) -> Option<Transform> {
        self.transforms.get(&binding).copied()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    fn slot_mut(&mut self, texture: TextureId) -> Result<&mut TextureSlot, GraphicsError> {
        self.textures
            .get_mut(&texture)
            .ok_or(GraphicsError::UnknownTexture(texture))
    }
}

impl GpuContext for HeadlessContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_external_texture(
        &mut self,
        size: Option<(u32, u32)>,
    ) -> Result<TextureId, GraphicsError> {
        if self.fail_textures {
            return Err(GraphicsError::Texture(format!(
                "{}: texture allocation refused",
                self.label
            )));
        }
        let texture = TextureId(self.arena.allocate(HandleKind::Texture, &self.label));
        self.textures.insert(
            texture,
            TextureSlot {
                size,
                latched: None,
            },
        );
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) -> Result<(), GraphicsError> {
        if self.textures.remove(&texture).is_none() {
            return Err(GraphicsError::UnknownTexture(texture));
        }
        self.bound.retain(|_, bound| *bound != texture);
        self.arena.release(HandleKind::Texture, texture.0)
    }

    fn upload_frame(&mut self, texture: TextureId, frame: &Frame) -> Result<(), GraphicsError> {
        let slot = self.slot_mut(texture)?;
        slot.size = Some((frame.width, frame.height));
        slot.latched = Some(frame.sequence);
        self.uploads += 1;
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> Result<(), GraphicsError> {
        if !self.current {
            return Err(GraphicsError::MakeCurrent(format!(
                "{}: no current context",
                self.label
            )));
        }
        self.slot_mut(texture)?;
        self.bound.insert(unit, texture);
        Ok(())
    }

    fn set_transform(&mut self, binding: u32, transform: &Transform) -> Result<(), GraphicsError> {
        self.transforms.insert(binding, *transform);
        Ok(())
    }
}

/// [`GraphicsBackend`] whose handles live in a [`HandleArena`].
pub struct HeadlessBackend {
    label: String,
    arena: HandleArena,
    fail_points: Vec<FailPoint>,
    present_interval: Option<Duration>,
    swaps: u64,
}

impl HeadlessBackend {
    pub fn new(label: impl Into<String>, arena: HandleArena) -> Self {
        Self {
            label: label.into(),
            arena,
            fail_points: Vec::new(),
            present_interval: None,
            swaps: 0,
        }
    }

    pub fn with_fail_point(mut self, point: FailPoint) -> Self {
        self.fail_points.push(point);
        self
    }

    /// Sleeps this long in every swap, standing in for display refresh.
    pub fn with_present_interval(mut self, interval: Duration) -> Self {
        self.present_interval = Some(interval);
        self
    }

    pub fn arena(&self) -> &HandleArena {
        &self.arena
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.fail_points.contains(&point)
    }

    fn swap_fails(&self) -> bool {
        self.fail_points.iter().any(|point| match point {
            FailPoint::Swap { after } => self.swaps >= *after,
            _ => false,
        })
    }

    fn injected(&self, point: FailPoint) -> String {
        format!("{}: injected failure at {point:?}", self.label)
    }
}

impl GraphicsBackend for HeadlessBackend {
    type Display = HeadlessDisplay;
    type Context = HeadlessContext;
    type Surface = HeadlessSurface;

    fn name(&self) -> &str {
        "headless"
    }

    fn open_display(&mut self) -> Result<HeadlessDisplay, GraphicsError> {
        if self.fails(FailPoint::OpenDisplay) {
            return Err(GraphicsError::DisplayUnavailable(
                self.injected(FailPoint::OpenDisplay),
            ));
        }
        let id = self.arena.allocate(HandleKind::Display, &self.label);
        Ok(HeadlessDisplay { id })
    }

    fn create_context(
        &mut self,
        _display: &HeadlessDisplay,
        config: &ContextConfig,
    ) -> Result<HeadlessContext, GraphicsError> {
        config.validate()?;
        if self.fails(FailPoint::CreateContext) {
            return Err(GraphicsError::ContextCreation(
                self.injected(FailPoint::CreateContext),
            ));
        }
        let id = self.arena.allocate(HandleKind::Context, &self.label);
        Ok(HeadlessContext {
            id,
            label: self.label.clone(),
            arena: self.arena.clone(),
            fail_textures: self.fails(FailPoint::CreateTexture),
            current: false,
            textures: HashMap::new(),
            bound: HashMap::new(),
            transforms: HashMap::new(),
            uploads: 0,
        })
    }

    fn create_surface(
        &mut self,
        _display: &HeadlessDisplay,
        _context: &HeadlessContext,
        target: &SurfaceTarget,
    ) -> Result<HeadlessSurface, GraphicsError> {
        if self.fails(FailPoint::CreateSurface) {
            return Err(GraphicsError::SurfaceCreation(
                self.injected(FailPoint::CreateSurface),
            ));
        }
        let size = target.size();
        if size.0 == 0 || size.1 == 0 {
            return Err(GraphicsError::SurfaceCreation(format!(
                "{}: empty surface {}x{}",
                self.label, size.0, size.1
            )));
        }
        let id = self.arena.allocate(HandleKind::Surface, &self.label);
        Ok(HeadlessSurface {
            id,
            size,
            presented: 0,
        })
    }

    fn make_current(
        &mut self,
        _display: &HeadlessDisplay,
        context: &mut HeadlessContext,
        _surface: &HeadlessSurface,
    ) -> Result<(), GraphicsError> {
        if self.fails(FailPoint::MakeCurrent) {
            return Err(GraphicsError::MakeCurrent(
                self.injected(FailPoint::MakeCurrent),
            ));
        }
        context.current = true;
        Ok(())
    }

    fn swap_buffers(
        &mut self,
        _display: &HeadlessDisplay,
        _context: &mut HeadlessContext,
        surface: &mut HeadlessSurface,
    ) -> Result<(), GraphicsError> {
        if self.swap_fails() {
            return Err(GraphicsError::Present(format!(
                "{}: injected failure after {} swaps",
                self.label, self.swaps
            )));
        }
        if let Some(interval) = self.present_interval {
            thread::sleep(interval);
        }
        self.swaps += 1;
        surface.presented += 1;
        Ok(())
    }

    fn destroy_surface(
        &mut self,
        _display: &HeadlessDisplay,
        surface: HeadlessSurface,
    ) -> Result<(), GraphicsError> {
        self.arena.release(HandleKind::Surface, surface.id)?;
        if self.fails(FailPoint::DestroySurface) {
            return Err(GraphicsError::Teardown(
                self.injected(FailPoint::DestroySurface),
            ));
        }
        Ok(())
    }

    fn destroy_context(
        &mut self,
        _display: &HeadlessDisplay,
        context: HeadlessContext,
    ) -> Result<(), GraphicsError> {
        // Textures still alive here were abandoned by a forced destroy; they go
        // down with the context.
        for texture in context.textures.keys() {
            tracing::debug!(%texture, context = %context.label, "reclaiming texture with context");
            let _ = self.arena.release(HandleKind::Texture, texture.0);
        }
        self.arena.release(HandleKind::Context, context.id)?;
        if self.fails(FailPoint::DestroyContext) {
            return Err(GraphicsError::Teardown(
                self.injected(FailPoint::DestroyContext),
            ));
        }
        Ok(())
    }

    fn terminate_display(&mut self, display: HeadlessDisplay) -> Result<(), GraphicsError> {
        self.arena.release(HandleKind::Display, display.id)?;
        if self.fails(FailPoint::TerminateDisplay) {
            return Err(GraphicsError::Teardown(
                self.injected(FailPoint::TerminateDisplay),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(backend: &mut HeadlessBackend) -> (HeadlessDisplay, HeadlessContext, HeadlessSurface) {
        let display = backend.open_display().unwrap();
        let mut context = backend
            .create_context(&display, &ContextConfig::default())
            .unwrap();
        let surface = backend
            .create_surface(&display, &context, &SurfaceTarget::offscreen(4, 4))
            .unwrap();
        backend.make_current(&display, &mut context, &surface).unwrap();
        (display, context, surface)
    }

    #[test]
    fn full_lifecycle_leaves_arena_clean() {
        let arena = HandleArena::new();
        let mut backend = HeadlessBackend::new("unit", arena.clone());
        let (display, mut context, mut surface) = open(&mut backend);

        let texture = context.create_external_texture(None).unwrap();
        context.bind_texture(0, texture).unwrap();
        context
            .upload_frame(texture, &Frame::new(5, 8, 8))
            .unwrap();
        assert_eq!(context.latched_sequence(texture), Some(5));
        assert_eq!(context.texture_size(texture), Some((8, 8)));
        backend
            .swap_buffers(&display, &mut context, &mut surface)
            .unwrap();
        assert_eq!(surface.presented(), 1);
        assert_eq!(arena.live_count(HandleKind::Texture), 1);

        context.delete_texture(texture).unwrap();
        assert_eq!(context.bound_texture(0), None);
        backend.destroy_surface(&display, surface).unwrap();
        backend.destroy_context(&display, context).unwrap();
        backend.terminate_display(display).unwrap();
        assert!(arena.is_clean(), "leaked: {arena:?}");
    }

    #[test]
    fn failing_teardown_step_still_releases_handle() {
        let arena = HandleArena::new();
        let mut backend =
            HeadlessBackend::new("unit", arena.clone()).with_fail_point(FailPoint::DestroyContext);
        let (display, context, surface) = open(&mut backend);
        backend.destroy_surface(&display, surface).unwrap();
        assert!(matches!(
            backend.destroy_context(&display, context),
            Err(GraphicsError::Teardown(_))
        ));
        backend.terminate_display(display).unwrap();
        assert!(arena.is_clean());
    }

    #[test]
    fn context_teardown_reclaims_abandoned_textures() {
        let arena = HandleArena::new();
        let mut backend = HeadlessBackend::new("unit", arena.clone());
        let (display, mut context, surface) = open(&mut backend);
        context.create_external_texture(Some((2, 2))).unwrap();
        backend.destroy_surface(&display, surface).unwrap();
        backend.destroy_context(&display, context).unwrap();
        backend.terminate_display(display).unwrap();
        assert!(arena.is_clean());
        assert_eq!(arena.total_created(HandleKind::Texture), 1);
    }

    #[test]
    fn swap_fail_point_triggers_after_threshold() {
        let arena = HandleArena::new();
        let mut backend =
            HeadlessBackend::new("unit", arena).with_fail_point(FailPoint::Swap { after: 2 });
        let (display, mut context, mut surface) = open(&mut backend);
        for _ in 0..2 {
            backend
                .swap_buffers(&display, &mut context, &mut surface)
                .unwrap();
        }
        assert!(matches!(
            backend.swap_buffers(&display, &mut context, &mut surface),
            Err(GraphicsError::Present(_))
        ));
    }

    #[test]
    fn releasing_unknown_handle_is_an_error() {
        let arena = HandleArena::new();
        let id = arena.allocate(HandleKind::Surface, "unit");
        assert!(arena.release(HandleKind::Texture, id).is_err());
        arena.release(HandleKind::Surface, id).unwrap();
        assert!(arena.release(HandleKind::Surface, id).is_err());
    }
}
