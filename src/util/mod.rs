pub mod addr;
pub mod buf;
pub mod rolling_stats;
