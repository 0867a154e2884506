pub mod cache_controller;
pub mod health_controller;
pub mod render_controller;
pub mod tokens_controller;

pub use cache_controller::{cache_stats_handler, invalidate_role_handler, invalidate_user_handler};
pub use health_controller::health_handler;
pub use render_controller::render_dashboard_handler;
pub use tokens_controller::blacklist_token_handler;
