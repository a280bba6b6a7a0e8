//! Owning wrappers around device resources.
//!
//! Dropping a wrapper queues its handle for release; the context destroys
//! queued handles in [`RenderContext::collect_garbage`].

use radiance_common::{mip_extent, RenderError, TextureFormat};

use crate::context::{ReleaseQueue, RenderContext};
use crate::device::{
    AttachmentTarget, CubemapDesc, CubemapId, FramebufferDesc, FramebufferId, GraphicsDevice,
    ResourceHandle, TextureDesc, TextureId,
};

pub struct Texture {
    id: TextureId,
    width: u32,
    height: u32,
    format: TextureFormat,
    release: ReleaseQueue,
}

impl Texture {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        desc: &TextureDesc<'_>,
    ) -> Result<Self, RenderError> {
        let id = ctx.device_mut().create_texture(desc)?;
        Ok(Self {
            id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            release: ctx.release_queue(),
        })
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.release
            .borrow_mut()
            .push(ResourceHandle::Texture(self.id));
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("extent", &(self.width, self.height))
            .field("format", &self.format)
            .finish()
    }
}

/// Six-face image array with a mip chain.
pub struct Cubemap {
    id: CubemapId,
    size: u32,
    mip_count: u32,
    format: TextureFormat,
    release: ReleaseQueue,
}

impl Cubemap {
    pub fn new<D: GraphicsDevice>(
        ctx: &mut RenderContext<D>,
        desc: &CubemapDesc<'_>,
    ) -> Result<Self, RenderError> {
        let id = ctx.device_mut().create_cubemap(desc)?;
        Ok(Self {
            id,
            size: desc.size,
            mip_count: desc.mip_count,
            format: desc.format,
            release: ctx.release_queue(),
        })
    }

    pub fn id(&self) -> CubemapId {
        self.id
    }

    /// Face extent of mip 0.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    pub fn mip_size(&self, mip: u32) -> u32 {
        mip_extent(self.size, mip)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

impl Drop for Cubemap {
    fn drop(&mut self) {
        self.release
            .borrow_mut()
            .push(ResourceHandle::Cubemap(self.id));
    }
}

impl std::fmt::Debug for Cubemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cubemap")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("mip_count", &self.mip_count)
            .field("format", &self.format)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct ColorSlot {
    format: TextureFormat,
    owned: bool,
}

#[derive(Debug, Clone, Copy)]
struct DepthSpec {
    format: TextureFormat,
}

/// Fluent construction of a [`Framebuffer`].
#[derive(Debug, Clone)]
pub struct FramebufferBuilder {
    label: String,
    width: u32,
    height: u32,
    colors: Vec<ColorSlot>,
    depth: Option<DepthSpec>,
}

impl FramebufferBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Color slot backed by a texture the framebuffer owns.
    pub fn add_color_texture(mut self, format: TextureFormat) -> Self {
        self.colors.push(ColorSlot {
            format,
            owned: true,
        });
        self
    }

    /// Detached color slot; the caller binds a target before drawing.
    pub fn add_color_slot(mut self, format: TextureFormat) -> Self {
        self.colors.push(ColorSlot {
            format,
            owned: false,
        });
        self
    }

    pub fn add_depth(mut self) -> Self {
        self.depth = Some(DepthSpec {
            format: TextureFormat::Depth32Float,
        });
        self
    }

    pub fn add_depth_stencil(mut self) -> Self {
        self.depth = Some(DepthSpec {
            format: TextureFormat::Depth24PlusStencil8,
        });
        self
    }

    /// Depth attachment meant to be sampled afterwards (shadow maps).
    pub fn add_depth_texture(self) -> Self {
        self.add_depth()
    }

    pub fn build<D: GraphicsDevice>(
        self,
        ctx: &mut RenderContext<D>,
    ) -> Result<Framebuffer, RenderError> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::ResourceCreation {
                what: "framebuffer",
                reason: format!("empty extent {}x{}", self.width, self.height),
            });
        }
        let color_formats = self.colors.iter().map(|c| c.format).collect();
        let id = ctx.device_mut().create_framebuffer(&FramebufferDesc {
            label: &self.label,
            color_formats,
        })?;
        let mut framebuffer = Framebuffer {
            id,
            width: self.width,
            height: self.height,
            color_formats: self.colors.iter().map(|c| c.format).collect(),
            owned_colors: Vec::with_capacity(self.colors.len()),
            depth: None,
            depth_format: self.depth.map(|d| d.format),
            release: ctx.release_queue(),
        };

        for (slot, color) in self.colors.iter().enumerate() {
            if !color.owned {
                framebuffer.owned_colors.push(None);
                continue;
            }
            let label = format!("{}.color{slot}", self.label);
            let texture = Texture::new(
                ctx,
                &TextureDesc {
                    label: &label,
                    width: self.width,
                    height: self.height,
                    format: color.format,
                },
            )?;
            ctx.device_mut().set_color_attachment(
                id,
                slot,
                AttachmentTarget::Texture(texture.id()),
            )?;
            framebuffer.owned_colors.push(Some(texture));
        }

        if self.depth.is_some() {
            framebuffer.resize_depth_attachment(ctx, self.width, self.height)?;
        }
        tracing::debug!(
            label = %self.label,
            width = self.width,
            height = self.height,
            color_slots = framebuffer.color_formats.len(),
            depth = ?framebuffer.depth_format,
            "framebuffer created"
        );
        Ok(framebuffer)
    }
}

/// A render target: color slots plus an optional depth attachment.
///
/// Slots built with [`FramebufferBuilder::add_color_slot`] are retargeted at
/// runtime without recreating the framebuffer.
pub struct Framebuffer {
    id: FramebufferId,
    width: u32,
    height: u32,
    color_formats: Vec<TextureFormat>,
    owned_colors: Vec<Option<Texture>>,
    depth: Option<Texture>,
    depth_format: Option<TextureFormat>,
    release: ReleaseQueue,
}

impl Framebuffer {
    pub fn builder(width: u32, height: u32) -> FramebufferBuilder {
        FramebufferBuilder {
            label: "framebuffer".to_string(),
            width,
            height,
            colors: Vec::new(),
            depth: None,
        }
    }

    pub fn id(&self) -> FramebufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_slot_count(&self) -> usize {
        self.color_formats.len()
    }

    pub fn color_format(&self, slot: usize) -> Option<TextureFormat> {
        self.color_formats.get(slot).copied()
    }

    /// Texture owned by `slot`, if the slot was built with one.
    pub fn color_texture(&self, slot: usize) -> Option<TextureId> {
        self.owned_colors
            .get(slot)
            .and_then(|t| t.as_ref())
            .map(Texture::id)
    }

    pub fn depth_texture(&self) -> Option<TextureId> {
        self.depth.as_ref().map(Texture::id)
    }

    /// Current extent of the depth attachment.
    pub fn depth_extent(&self) -> Option<(u32, u32)> {
        self.depth.as_ref().map(|d| (d.width(), d.height()))
    }

    pub fn set_color_attachment<D: GraphicsDevice>(
        &self,
        ctx: &mut RenderContext<D>,
        slot: usize,
        target: AttachmentTarget,
    ) -> Result<(), RenderError> {
        ctx.device_mut().set_color_attachment(self.id, slot, target)
    }

    /// Bind `target` to slot 0, run `body`, then detach the slot. The slot
    /// is detached even when `body` fails.
    pub fn with_color_attachment<D, T, F>(
        &self,
        ctx: &mut RenderContext<D>,
        target: AttachmentTarget,
        body: F,
    ) -> Result<T, RenderError>
    where
        D: GraphicsDevice,
        F: FnOnce(&mut RenderContext<D>) -> Result<T, RenderError>,
    {
        self.set_color_attachment(ctx, 0, target)?;
        let result = body(ctx);
        let reset = self.set_color_attachment(ctx, 0, AttachmentTarget::None);
        let value = result?;
        reset?;
        Ok(value)
    }

    /// Replace the depth attachment with one of the given extent.
    pub fn resize_depth_attachment<D: GraphicsDevice>(
        &mut self,
        ctx: &mut RenderContext<D>,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        let Some(format) = self.depth_format else {
            return Err(RenderError::ResourceCreation {
                what: "depth attachment",
                reason: format!("framebuffer {} has no depth attachment", self.id.0),
            });
        };
        if self.depth_extent() == Some((width, height)) {
            return Ok(());
        }
        let texture = Texture::new(
            ctx,
            &TextureDesc {
                label: "depth",
                width,
                height,
                format,
            },
        )?;
        ctx.device_mut()
            .set_depth_attachment(self.id, Some(texture.id()))?;
        // The old attachment is queued for release here.
        self.depth = Some(texture);
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.release
            .borrow_mut()
            .push(ResourceHandle::Framebuffer(self.id));
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("extent", &(self.width, self.height))
            .field("color_formats", &self.color_formats)
            .field("depth_format", &self.depth_format)
            .finish()
    }
}
