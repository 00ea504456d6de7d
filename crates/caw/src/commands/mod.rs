pub mod active_path;
pub mod shift;
pub mod status;
pub mod watch;
