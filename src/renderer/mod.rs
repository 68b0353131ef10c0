pub mod config;
pub mod core;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod raytracing;
pub mod render_pass;
pub mod resources;
pub mod shaders;
pub mod subsystems;
