pub mod allocator;
pub mod layout;
pub mod manager;
