pub mod config;
pub mod error;
pub mod db;
pub mod graph;
pub mod crawl;

pub use config::Config;
pub use error::{Result, SwgraphError};
pub use crawl::{CrawlDriver, DrainReport, HttpSource, RetryPolicy};
