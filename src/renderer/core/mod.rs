pub mod context;
pub mod device;
pub mod instance;
pub mod queue;
pub mod swapchain;
