pub mod event;
pub mod item;
pub mod route;
pub mod session;
pub mod stop;
pub mod transfer;
