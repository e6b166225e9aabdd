pub mod optimizer;
pub mod route;
pub mod stops;
pub mod transfer;
pub mod watcher;
