//! Bounded concurrency for async jobs: cap how many run at once, track every
//! submission, and choose between fire-and-forget and backpressure-aware
//! scheduling.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod limiter;
