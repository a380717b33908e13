pub mod controller;
pub mod limiter;
pub mod pool;
pub mod registry;
pub mod types;
