//! wgpu backend for the radiance renderer.
//!
//! [`WgpuDevice`] implements [`radiance_render::GraphicsDevice`] on a
//! headless wgpu device, so every pass and probe bake in `radiance-render`
//! runs unchanged on the GPU.
//!
//! # Invariants
//! - Each clear and draw is its own submission; commands complete in call
//!   order.
//! - Validation failures surface as `RenderError::Backend`, never as panics.
//! - Cube faces are uploaded and read back row-major with row 0 at the top,
//!   matching the software device.

mod gpu;
mod meshes;
mod shaders;

pub use gpu::WgpuDevice;

pub fn crate_info() -> &'static str {
    "radiance-render-wgpu v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("wgpu"));
    }
}
