use crate::types::TextureFormat;

/// Errors raised by render resources, passes and backends.
///
/// Resource failures are unrecoverable for a bake; callers propagate them and
/// abort the sequence.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("attachment extent {attachment:?} does not match depth extent {depth:?}")]
    AttachmentMismatch {
        attachment: (u32, u32),
        depth: (u32, u32),
    },
    #[error("color slot {slot} of framebuffer {framebuffer} has no attachment")]
    UnboundAttachment { framebuffer: u32, slot: usize },
    #[error("draw issued without a bound framebuffer")]
    NoFramebufferBound,
    #[error("draw issued without an active shader")]
    NoShaderBound,
    #[error("unknown uniform `{0}`")]
    UnknownUniform(String),
    #[error("uniform `{name}` expects {expected}")]
    UniformType {
        name: String,
        expected: &'static str,
    },
    #[error("color slot {slot} expects {expected:?}, got {actual:?}")]
    AttachmentFormat {
        slot: usize,
        expected: TextureFormat,
        actual: TextureFormat,
    },
    #[error("cube face index {0} out of range 0..6")]
    InvalidCubeFace(usize),
    #[error("cubemap {0} is sampled and rendered to in the same draw")]
    FeedbackLoop(u32),
    #[error("{pass} pass expected {expected} input")]
    MissingInput {
        pass: &'static str,
        expected: &'static str,
    },
    #[error("expected {expected} output, got {actual}")]
    UnexpectedOutput {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        let err = RenderError::ResourceCreation {
            what: "cubemap",
            reason: "out of memory".into(),
        };
        assert_eq!(err.to_string(), "failed to create cubemap: out of memory");

        let err = RenderError::InvalidCubeFace(7);
        assert!(err.to_string().contains('7'));
    }
}
