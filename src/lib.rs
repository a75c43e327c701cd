pub mod ancestry;
pub mod checksum;
pub mod config;
pub mod error;
pub mod http;
pub mod images;
pub mod multipart;
pub mod pending;
pub mod pipeline;
pub mod storage;
pub mod upload;
