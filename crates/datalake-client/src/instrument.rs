// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Conditional tracing support.
//!
//! With the `profiling` feature enabled, preparation, upload and download
//! paths emit `tracing` spans; without it the attributes and spans compile
//! away entirely. The library never installs a subscriber, that is left to
//! the binary.
//!
//! Functions are instrumented with the `cfg_attr` pattern:
//!
//! ```rust,ignore
//! #[cfg_attr(feature = "profiling", tracing::instrument(skip(store)))]
//! pub async fn prepare_data_source(store: &dyn ObjectStore, ...) -> Result<...> {
//!     // ...
//! }
//! ```
//!
//! Spawned tasks are wrapped with [`Instrument`] so their spans nest under
//! the caller's.

#[cfg(feature = "profiling")]
pub use tracing::{Instrument, info_span};
