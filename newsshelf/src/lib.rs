// Library interface for newsshelf modules
// This allows tests and other binaries to import modules

pub mod analysis;
pub mod books;
pub mod error;
pub mod http;
pub mod llm;
pub mod news;
pub mod processing;
pub mod ranking;
pub mod schedule;
pub mod server;
pub mod storage;
