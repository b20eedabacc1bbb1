//! [`MatchRepository`](crate::MatchRepository) implementations.
//!
//! | Feature           | Repository                |
//! |-------------------|---------------------------|
//! | `http-repository` | [`HttpMatchRepository`]   |

#[cfg(feature = "http-repository")]
pub mod http;

#[cfg(feature = "http-repository")]
pub use http::{HttpMatchRepository, HttpRepositoryConfig};
