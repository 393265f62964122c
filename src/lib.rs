pub mod batch;
pub mod cmd;
pub mod config;
pub mod convert;
pub mod db;
pub mod downloader;
mod error;
pub mod hentaifox;
pub mod history;
pub mod logs;
pub mod paths;
pub mod site;
pub mod tools;

pub use error::{EngineError, Result};
