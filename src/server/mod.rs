pub mod items;
pub mod runtime;

pub use items::{Item, ItemStore};
pub use runtime::{AppState, create_router, start_server};
