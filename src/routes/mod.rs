pub mod catchers;
pub mod ping;
pub mod predict;
pub mod welcome;
