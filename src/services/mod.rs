pub mod analytics;
pub mod auth;
pub mod init;
pub mod notices;
pub mod push;
pub mod scheduler;
pub mod segmentation;
pub mod tracker;
