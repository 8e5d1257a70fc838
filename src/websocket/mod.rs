pub mod handler;

pub use handler::{robot_ws_handler, robots_ws_handler, router, user_robots_ws_handler};
