use std::time::Duration;

use thiserror::Error as ThisError;

use crate::DescriptorHeapCategory;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Neither native ray tracing nor the compute fallback could be enabled")]
    CapabilityUnavailable,
    #[error("Failed to create {what}")]
    ResourceCreationFailed {
        what: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to create root signature")]
    RootSignatureCreationFailed(#[source] anyhow::Error),
    #[error("Failed to create ray tracing pipeline state")]
    PipelineCreationFailed(#[source] anyhow::Error),
    #[error("Pipeline has no shader export named {0:?}")]
    UnknownShaderExport(String),
    #[error("Acceleration structure sizing failed: {0}")]
    SizingFailed(String),
    #[error("Failed to build {table} shader table: {reason}")]
    TableBuildFailed { table: &'static str, reason: String },
    #[error("Descriptor heap {category} exhausted ({capacity} descriptors)")]
    DescriptorHeapExhausted {
        category: DescriptorHeapCategory,
        capacity: u32,
    },
    #[error("Invalid scene: {0}")]
    InvalidScene(String),
    #[error("Failed to record or submit GPU work")]
    Submission(#[source] anyhow::Error),
    #[error("Fence did not reach {expected} within {timeout:?}, device presumed lost")]
    DeviceLost { expected: u64, timeout: Duration },
}

impl Error {
    pub(crate) fn creation(what: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ResourceCreationFailed {
            what: what.into(),
            source,
        }
    }
}
