pub mod robot;
pub mod tick;
pub mod ws;

pub use robot::*;
pub use tick::*;
pub use ws::*;
