pub mod renderer;

pub use renderer::error::{ErrorClass, HriError, Result};
