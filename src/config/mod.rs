pub mod loader;
pub mod models;

pub use loader::*;
pub use models::*;
