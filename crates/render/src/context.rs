//! Render-state cache and scoped restoration.
//!
//! # Invariants
//! - The device always holds the state returned by [`RenderContext::state`].
//! - A [`StateScope`] puts back the state it captured when dropped, including
//!   on early return and error paths.
//! - Resource wrappers never touch the device in `Drop`; they queue their
//!   handle and [`RenderContext::collect_garbage`] destroys it later.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use glam::Vec4;
use radiance_common::RenderError;

use crate::device::{
    ClearValues, CubemapId, Geometry, GraphicsDevice, ResourceHandle, SampledResource,
    ShaderKind, TextureId,
};
use crate::resource::Framebuffer;
use crate::state::{CompareFunction, RenderState, StencilFunc, StencilOperation, StencilOps, Viewport};
use crate::uniforms::UniformValue;

/// Handles waiting to be destroyed.
pub(crate) type ReleaseQueue = Rc<RefCell<Vec<ResourceHandle>>>;

/// Owns the device and mirrors its fixed-function state.
pub struct RenderContext<D: GraphicsDevice> {
    device: D,
    state: RenderState,
    releases: ReleaseQueue,
}

impl<D: GraphicsDevice> RenderContext<D> {
    pub fn new(mut device: D) -> Result<Self, RenderError> {
        let state = RenderState::default();
        device.apply_state(&state)?;
        tracing::debug!(backend = device.backend_name(), "render context created");
        Ok(Self {
            device,
            state,
            releases: Rc::new(RefCell::new(Vec::new())),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Direct device access, for uploads and readback. State changes must go
    /// through the context.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub(crate) fn release_queue(&self) -> ReleaseQueue {
        Rc::clone(&self.releases)
    }

    /// Destroy resources whose wrappers were dropped. Returns how many.
    pub fn collect_garbage(&mut self) -> usize {
        let pending: Vec<ResourceHandle> = self.releases.borrow_mut().drain(..).collect();
        for handle in &pending {
            self.device.destroy(*handle);
        }
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "released device resources");
        }
        pending.len()
    }

    /// Capture the current state; it is restored when the guard drops.
    pub fn scoped(&mut self) -> StateScope<'_, D> {
        let saved = self.state;
        StateScope { ctx: self, saved }
    }

    fn update(&mut self, f: impl FnOnce(&mut RenderState)) -> Result<(), RenderError> {
        let mut next = self.state;
        f(&mut next);
        if next != self.state {
            self.device.apply_state(&next)?;
            self.state = next;
        }
        Ok(())
    }

    pub fn switch_shader(&mut self, shader: ShaderKind) -> Result<(), RenderError> {
        self.update(|s| s.shader = Some(shader))
    }

    pub fn bind_framebuffer(&mut self, framebuffer: &Framebuffer) -> Result<(), RenderError> {
        let id = framebuffer.id();
        self.update(|s| s.framebuffer = Some(id))
    }

    pub fn unbind_framebuffer(&mut self) -> Result<(), RenderError> {
        self.update(|s| s.framebuffer = None)
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        self.update(|s| s.viewport = Viewport::new(width, height))
    }

    pub fn set_depth_test(&mut self, enabled: bool) -> Result<(), RenderError> {
        self.update(|s| s.depth_test = enabled)
    }

    pub fn set_depth_func(&mut self, func: CompareFunction) -> Result<(), RenderError> {
        self.update(|s| s.depth_func = func)
    }

    pub fn set_face_cull(&mut self, enabled: bool) -> Result<(), RenderError> {
        self.update(|s| s.face_cull = enabled)
    }

    pub fn set_blend(&mut self, enabled: bool) -> Result<(), RenderError> {
        self.update(|s| s.blend = enabled)
    }

    pub fn set_multisample(&mut self, enabled: bool) -> Result<(), RenderError> {
        self.update(|s| s.multisample = enabled)
    }

    pub fn set_stencil_test(&mut self, enabled: bool) -> Result<(), RenderError> {
        self.update(|s| s.stencil_test = enabled)
    }

    pub fn set_stencil_write_mask(&mut self, mask: u8) -> Result<(), RenderError> {
        self.update(|s| s.stencil_write_mask = mask)
    }

    pub fn set_stencil_func(
        &mut self,
        compare: CompareFunction,
        reference: u8,
        read_mask: u8,
    ) -> Result<(), RenderError> {
        self.update(|s| {
            s.stencil_func = StencilFunc {
                compare,
                reference,
                read_mask,
            }
        })
    }

    pub fn set_stencil_op(
        &mut self,
        fail: StencilOperation,
        depth_fail: StencilOperation,
        pass: StencilOperation,
    ) -> Result<(), RenderError> {
        self.update(|s| {
            s.stencil_ops = StencilOps {
                fail,
                depth_fail,
                pass,
            }
        })
    }

    pub fn set_uniform(
        &mut self,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), RenderError> {
        self.device.set_uniform(name, value.into())
    }

    pub fn bind_cubemap(&mut self, unit: u32, cubemap: CubemapId) {
        self.device
            .bind_sampled(unit, Some(SampledResource::Cubemap(cubemap)));
    }

    pub fn bind_texture(&mut self, unit: u32, texture: TextureId) {
        self.device
            .bind_sampled(unit, Some(SampledResource::Texture(texture)));
    }

    pub fn unbind_unit(&mut self, unit: u32) {
        self.device.bind_sampled(unit, None);
    }

    pub fn clear(&mut self, values: ClearValues) -> Result<(), RenderError> {
        self.device.clear(values)
    }

    pub fn clear_color(&mut self, color: Vec4) -> Result<(), RenderError> {
        self.device.clear(ClearValues {
            color: Some(color),
            ..ClearValues::default()
        })
    }

    pub fn draw(&mut self, geometry: Geometry) -> Result<(), RenderError> {
        self.device.draw(geometry)
    }

    pub fn load_shader(&mut self, shader: ShaderKind) -> Result<(), RenderError> {
        self.device.load_shader(shader)
    }
}

/// Guard returned by [`RenderContext::scoped`]. Derefs to the context.
pub struct StateScope<'a, D: GraphicsDevice> {
    ctx: &'a mut RenderContext<D>,
    saved: RenderState,
}

impl<D: GraphicsDevice> StateScope<'_, D> {
    /// State that will be restored.
    pub fn saved(&self) -> &RenderState {
        &self.saved
    }
}

impl<D: GraphicsDevice> Deref for StateScope<'_, D> {
    type Target = RenderContext<D>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<D: GraphicsDevice> DerefMut for StateScope<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl<D: GraphicsDevice> Drop for StateScope<'_, D> {
    fn drop(&mut self) {
        let saved = self.saved;
        if let Err(err) = self.ctx.update(|s| *s = saved) {
            tracing::error!(%err, "failed to restore render state");
        }
    }
}
