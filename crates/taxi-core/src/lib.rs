//! Taxi-Core: shared error handling for the taxi backend crates.
//!
//! # Examples
//!
//! ```
//! use taxi_core::{Error, Result};
//!
//! fn parse_fare(input: &str) -> Result<f64> {
//!     input
//!         .parse()
//!         .map_err(|_| Error::invalid_input(format!("bad fare: {input}")))
//! }
//!
//! assert_eq!(parse_fare("12.5").unwrap(), 12.5);
//! assert!(parse_fare("twelve").is_err());
//! ```

pub mod error;

pub use error::{Error, Result};
