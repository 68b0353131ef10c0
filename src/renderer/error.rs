use std::time::Duration;
use ash::vk;
use thiserror::Error;

pub type Result<T, E = HriError> = std::result::Result<T, E>;

/// How the frame loop is expected to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device-level failure, the frame loop has to stop
    Fatal,
    /// Swapchain no longer matches the surface, recreate and retry
    SwapchainStale,
    /// API used out of order or with missing state
    Misuse,
    /// Unknown pipeline, shader or subsystem name
    NotFound,
}

#[derive(Error, Debug)]
pub enum HriError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Mapped memory copy failed: {0}")]
    MappedCopy(String),

    #[error("Descriptor pool limit of {0} pools reached")]
    PoolExhausted(usize),

    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout {
        timeout: Duration,
        what: &'static str,
    },

    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("{kind} not found: {name}")]
    NotFound {
        kind: &'static str,
        name: String,
    },

    #[error("Device limit violated: {0}")]
    DeviceLimit(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Window handle error: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
}

impl HriError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SwapchainOutOfDate => ErrorClass::SwapchainStale,
            Self::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)
            | Self::Vulkan(vk::Result::SUBOPTIMAL_KHR) => ErrorClass::SwapchainStale,
            Self::Precondition(_) => ErrorClass::Misuse,
            Self::NotFound { .. } => ErrorClass::NotFound,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_swapchain_stale(&self) -> bool {
        self.class() == ErrorClass::SwapchainStale
    }
}

impl<T> From<std::sync::PoisonError<T>> for HriError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockPoisoned(err.to_string())
    }
}
