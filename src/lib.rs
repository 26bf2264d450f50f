pub mod aggregate;
pub mod aorc;
pub mod catchments;
pub mod config;
pub mod fetch;
pub mod grid;
pub mod hrrr;
pub mod output;
pub mod pipeline;
pub mod post_process;
pub mod process_log;
pub mod projection;
pub mod time;
pub mod weights;
pub mod zarr;
