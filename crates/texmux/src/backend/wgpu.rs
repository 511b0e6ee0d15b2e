//! wgpu-backed implementation of [`GraphicsBackend`].
//!
//! wgpu has no notion of a thread-current context, so `make_current` is a
//! no-op; the render thread still owns its device and queue exclusively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::{
    ContextConfig, GpuContext, GraphicsBackend, GraphicsError, SurfaceTarget, TextureId,
    WindowTarget,
};
use crate::frame::{Frame, Transform};

const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const CLEAR_COLOUR: wgpu::Color = wgpu::Color {
    r: 0.02,
    g: 0.02,
    b: 0.03,
    a: 1.0,
};

static NEXT_TEXTURE: AtomicU64 = AtomicU64::new(1);

pub struct WgpuBackend {
    label: String,
    power_preference: wgpu::PowerPreference,
}

impl WgpuBackend {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            power_preference: wgpu::PowerPreference::default(),
        }
    }

    pub fn with_power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }
}

pub struct WgpuDisplay {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
}

struct FrameTexture {
    texture: wgpu::Texture,
    size: (u32, u32),
}

pub struct WgpuContext {
    label: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: HashMap<TextureId, FrameTexture>,
    bound: HashMap<u32, TextureId>,
    transforms: HashMap<u32, wgpu::Buffer>,
}

impl WgpuContext {
    fn create_frame_texture(&self, size: (u32, u32)) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("texmux frame texture"),
            size: wgpu::Extent3d {
                width: size.0.max(1),
                height: size.1.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn clear(&self, view: &wgpu::TextureView) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texmux present"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("texmux clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOUR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl GpuContext for WgpuContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_external_texture(
        &mut self,
        size: Option<(u32, u32)>,
    ) -> Result<TextureId, GraphicsError> {
        let size = size.unwrap_or((1, 1));
        let texture = self.create_frame_texture(size);
        let id = TextureId(NEXT_TEXTURE.fetch_add(1, Ordering::Relaxed));
        self.textures.insert(id, FrameTexture { texture, size });
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) -> Result<(), GraphicsError> {
        let entry = self
            .textures
            .remove(&texture)
            .ok_or(GraphicsError::UnknownTexture(texture))?;
        self.bound.retain(|_, bound| *bound != texture);
        entry.texture.destroy();
        Ok(())
    }

    fn upload_frame(&mut self, texture: TextureId, frame: &Frame) -> Result<(), GraphicsError> {
        let size = (frame.width, frame.height);
        let needs_resize = self
            .textures
            .get(&texture)
            .ok_or(GraphicsError::UnknownTexture(texture))?
            .size
            != size;
        if needs_resize {
            let replacement = self.create_frame_texture(size);
            if let Some(previous) = self.textures.insert(
                texture,
                FrameTexture {
                    texture: replacement,
                    size,
                },
            ) {
                previous.texture.destroy();
            }
            tracing::debug!(%texture, width = size.0, height = size.1, "resized frame texture");
        }

        let Some(pixels) = frame.pixels.as_deref() else {
            return Ok(());
        };
        let entry = self
            .textures
            .get(&texture)
            .ok_or(GraphicsError::UnknownTexture(texture))?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.width * 4),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) -> Result<(), GraphicsError> {
        if !self.textures.contains_key(&texture) {
            return Err(GraphicsError::UnknownTexture(texture));
        }
        self.bound.insert(unit, texture);
        Ok(())
    }

    fn set_transform(&mut self, binding: u32, transform: &Transform) -> Result<(), GraphicsError> {
        let device = &self.device;
        let buffer = self.transforms.entry(binding).or_insert_with(|| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("texmux transform"),
                size: std::mem::size_of::<Transform>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        self.queue.write_buffer(buffer, 0, bytemuck::bytes_of(transform));
        Ok(())
    }
}

pub enum WgpuSurface {
    Offscreen {
        texture: wgpu::Texture,
    },
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        // Keeps the native window alive for as long as the surface exists.
        _target: Arc<dyn WindowTarget>,
    },
}

impl GraphicsBackend for WgpuBackend {
    type Display = WgpuDisplay;
    type Context = WgpuContext;
    type Surface = WgpuSurface;

    fn name(&self) -> &str {
        "wgpu"
    }

    fn open_display(&mut self) -> Result<WgpuDisplay, GraphicsError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: self.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| GraphicsError::DisplayUnavailable(format!("{}: {err}", self.label)))?;
        let info = adapter.get_info();
        tracing::debug!(
            render_target = %self.label,
            adapter = %info.name,
            backend = ?info.backend,
            "opened wgpu adapter"
        );
        Ok(WgpuDisplay { instance, adapter })
    }

    fn create_context(
        &mut self,
        display: &WgpuDisplay,
        config: &ContextConfig,
    ) -> Result<WgpuContext, GraphicsError> {
        config.validate()?;
        if config.samples > 1 {
            tracing::debug!(samples = config.samples, "multisampling ignored by wgpu backend");
        }
        let (device, queue) =
            pollster::block_on(display.adapter.request_device(&wgpu::DeviceDescriptor {
                label: Some("texmux device"),
                required_features: wgpu::Features::empty(),
                required_limits: display.adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::default(),
            }))
            .map_err(|err| GraphicsError::ContextCreation(format!("{}: {err}", self.label)))?;
        Ok(WgpuContext {
            label: self.label.clone(),
            device,
            queue,
            textures: HashMap::new(),
            bound: HashMap::new(),
            transforms: HashMap::new(),
        })
    }

    fn create_surface(
        &mut self,
        display: &WgpuDisplay,
        context: &WgpuContext,
        target: &SurfaceTarget,
    ) -> Result<WgpuSurface, GraphicsError> {
        let (width, height) = target.size();
        if width == 0 || height == 0 {
            return Err(GraphicsError::SurfaceCreation(format!(
                "{}: empty surface {width}x{height}",
                self.label
            )));
        }
        match target {
            SurfaceTarget::Offscreen { .. } => {
                let texture = context.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("texmux offscreen target"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: OFFSCREEN_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                Ok(WgpuSurface::Offscreen { texture })
            }
            SurfaceTarget::Window(window) => {
                let window_handle = window
                    .window_handle()
                    .map_err(|err| GraphicsError::SurfaceCreation(err.to_string()))?;
                let display_handle = window
                    .display_handle()
                    .map_err(|err| GraphicsError::SurfaceCreation(err.to_string()))?;
                // SAFETY: `_target` keeps the window alive for the lifetime of
                // the surface, and the surface is dropped first.
                let surface = unsafe {
                    display
                        .instance
                        .create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                            raw_display_handle: display_handle.as_raw(),
                            raw_window_handle: window_handle.as_raw(),
                        })
                }
                .map_err(|err| GraphicsError::SurfaceCreation(err.to_string()))?;
                let config = surface
                    .get_default_config(&display.adapter, width, height)
                    .ok_or_else(|| {
                        GraphicsError::SurfaceCreation(format!(
                            "{}: surface not supported by adapter",
                            self.label
                        ))
                    })?;
                surface.configure(&context.device, &config);
                Ok(WgpuSurface::Window {
                    surface,
                    config,
                    _target: Arc::clone(window),
                })
            }
        }
    }

    fn make_current(
        &mut self,
        _display: &WgpuDisplay,
        _context: &mut WgpuContext,
        _surface: &WgpuSurface,
    ) -> Result<(), GraphicsError> {
        Ok(())
    }

    fn swap_buffers(
        &mut self,
        _display: &WgpuDisplay,
        context: &mut WgpuContext,
        surface: &mut WgpuSurface,
    ) -> Result<(), GraphicsError> {
        match surface {
            WgpuSurface::Offscreen { texture } => {
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                context.clear(&view);
                Ok(())
            }
            WgpuSurface::Window {
                surface, config, ..
            } => {
                let frame = match surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        tracing::debug!(render_target = %self.label, "surface lost; reconfiguring");
                        surface.configure(&context.device, config);
                        return Ok(());
                    }
                    Err(err) => return Err(GraphicsError::Present(err.to_string())),
                };
                let view = frame
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                context.clear(&view);
                frame.present();
                Ok(())
            }
        }
    }

    fn destroy_surface(
        &mut self,
        _display: &WgpuDisplay,
        surface: WgpuSurface,
    ) -> Result<(), GraphicsError> {
        if let WgpuSurface::Offscreen { texture } = &surface {
            texture.destroy();
        }
        drop(surface);
        Ok(())
    }

    fn destroy_context(
        &mut self,
        _display: &WgpuDisplay,
        context: WgpuContext,
    ) -> Result<(), GraphicsError> {
        for (id, entry) in &context.textures {
            tracing::debug!(texture = %id, "reclaiming texture with context");
            entry.texture.destroy();
        }
        for buffer in context.transforms.values() {
            buffer.destroy();
        }
        context.device.destroy();
        Ok(())
    }

    fn terminate_display(&mut self, display: WgpuDisplay) -> Result<(), GraphicsError> {
        drop(display);
        Ok(())
    }
}
