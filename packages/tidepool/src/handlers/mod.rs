pub mod events;
pub mod health;
pub mod todos;

// Re-export all handlers for easy route registration
pub use events::todo_events;
pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use todos::{create_todo, delete_todo, list_todos, update_todo};
