pub mod api;
pub mod encryption;
pub mod jobs;
pub mod notify;
pub mod quota;
pub mod session;
pub mod storage;
