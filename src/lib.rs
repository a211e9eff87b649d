pub mod answered;
pub mod config;
pub mod dispatch;
pub mod feed;
pub mod images;
pub mod pipeline;
pub mod sender;
pub mod storage;
