//! Fixed-function render state.

use crate::device::{FramebufferId, ShaderKind};

/// Depth and stencil comparison. `incoming OP stored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    pub fn test<T: PartialOrd>(self, incoming: T, stored: T) -> bool {
        match self {
            CompareFunction::Never => false,
            CompareFunction::Less => incoming < stored,
            CompareFunction::Equal => incoming == stored,
            CompareFunction::LessEqual => incoming <= stored,
            CompareFunction::Greater => incoming > stored,
            CompareFunction::NotEqual => incoming != stored,
            CompareFunction::GreaterEqual => incoming >= stored,
            CompareFunction::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
}

impl StencilOperation {
    /// New stencil value before the write mask is applied.
    pub fn apply(self, stored: u8, reference: u8) -> u8 {
        match self {
            StencilOperation::Keep => stored,
            StencilOperation::Zero => 0,
            StencilOperation::Replace => reference,
            StencilOperation::IncrementClamp => stored.saturating_add(1),
            StencilOperation::DecrementClamp => stored.saturating_sub(1),
            StencilOperation::Invert => !stored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFunc {
    pub compare: CompareFunction,
    pub reference: u8,
    pub read_mask: u8,
}

impl Default for StencilFunc {
    fn default() -> Self {
        Self {
            compare: CompareFunction::Always,
            reference: 0,
            read_mask: 0xFF,
        }
    }
}

impl StencilFunc {
    pub fn passes(&self, stored: u8) -> bool {
        self.compare
            .test(self.reference & self.read_mask, stored & self.read_mask)
    }
}

/// Operations for stencil fail, depth fail and depth pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilOps {
    pub fail: StencilOperation,
    pub depth_fail: StencilOperation,
    pub pass: StencilOperation,
}

impl Default for StencilOps {
    fn default() -> Self {
        Self {
            fail: StencilOperation::Keep,
            depth_fail: StencilOperation::Keep,
            pass: StencilOperation::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Everything that governs a draw apart from uniforms and sampler bindings.
///
/// Exactly one shader and one framebuffer are active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub shader: Option<ShaderKind>,
    pub framebuffer: Option<FramebufferId>,
    pub viewport: Viewport,
    pub depth_test: bool,
    pub depth_func: CompareFunction,
    /// Back faces are culled when enabled.
    pub face_cull: bool,
    /// Source-alpha blending.
    pub blend: bool,
    pub multisample: bool,
    pub stencil_test: bool,
    pub stencil_write_mask: u8,
    pub stencil_func: StencilFunc,
    pub stencil_ops: StencilOps,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            shader: None,
            framebuffer: None,
            viewport: Viewport::default(),
            depth_test: true,
            depth_func: CompareFunction::Less,
            face_cull: true,
            blend: false,
            multisample: false,
            stencil_test: false,
            stencil_write_mask: 0xFF,
            stencil_func: StencilFunc::default(),
            stencil_ops: StencilOps::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_functions() {
        assert!(CompareFunction::Less.test(0.2, 0.5));
        assert!(!CompareFunction::Less.test(0.5, 0.5));
        assert!(CompareFunction::LessEqual.test(1.0, 1.0));
        assert!(CompareFunction::Always.test(9, 0));
        assert!(!CompareFunction::Never.test(0, 0));
    }

    #[test]
    fn stencil_ops_respect_reference() {
        assert_eq!(StencilOperation::Replace.apply(7, 2), 2);
        assert_eq!(StencilOperation::Keep.apply(7, 2), 7);
        assert_eq!(StencilOperation::IncrementClamp.apply(255, 0), 255);
        assert_eq!(StencilOperation::Invert.apply(0x0F, 0), 0xF0);
    }

    #[test]
    fn stencil_func_masks_both_sides() {
        let func = StencilFunc {
            compare: CompareFunction::Equal,
            reference: 0x12,
            read_mask: 0x0F,
        };
        assert!(func.passes(0x02));
        assert!(func.passes(0xF2));
        assert!(!func.passes(0x01));
    }
}
