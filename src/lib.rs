pub mod common;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod objective;
pub mod params;
pub mod synthesis;
pub mod train;
pub mod utils;
