//! Check that log-event generators and the parsers shipped for them agree.
//!
//! `ocsf-parser-check` discovers generator templates and parser
//! configurations, pairs them by product, and answers per product: "does the
//! parser we ship extract the fields this generator's output presents?"
//!
//! # Features
//!
//! - Static scoring: format compatibility and field coverage, no network
//! - Fuzzy product-name resolution for generators without an exact parser
//! - Live validation: send tagged events, poll the query endpoint with
//!   backoff, and measure per-field extraction rates
//! - Severity-ranked issues by business tier, with a JSON result set and a
//!   Markdown report
//! - Parser search in a paginated remote repository (`http` feature)
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ocsf_parser_check::catalog::Catalog;
//! use ocsf_parser_check::config::ValidatorConfig;
//! use ocsf_parser_check::engine::ValidationContext;
//!
//! let catalog = Catalog::discover(Path::new("generators/"), Path::new("parsers/"))?;
//! let context = ValidationContext::new(ValidatorConfig::default(), catalog);
//! let results = context.validate_static()?;
//! results.write(Path::new("out/"))?;
//! # Ok::<(), ocsf_parser_check::error::Error>(())
//! ```

pub mod aggregate;
pub mod backoff;
pub mod catalog;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod expectation;
pub mod fuzzy;
pub mod generator;
pub mod live;
pub mod model;
pub mod rate_limit;
pub mod remote;
pub mod report;
pub mod scorer;
