//! Crawl orchestration: a `DocumentSource` to fetch from and a `CrawlDriver`
//! that seeds the store and drains it until every discovered entity is
//! hydrated or failed.

pub mod driver;
pub mod source;

pub use driver::{CrawlDriver, CycleOutcome, DrainReport, RetryPolicy, SeedReport};
pub use source::{DocumentSource, HttpSource};
