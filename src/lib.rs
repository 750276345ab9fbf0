pub mod backup;
pub mod checksum;
pub mod config;
pub mod consul;
pub mod domain;
pub mod download;
pub mod error;
pub mod metadata;
pub mod multipart;
pub mod object_store;
pub mod shutdown;
pub mod signpost;
pub mod state;
pub mod supervisor;
