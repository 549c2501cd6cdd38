pub mod aggregator;
pub mod frame;
pub mod moments;
pub mod unit;
pub mod utils;
