//! This module provides the ability to set some options at call time.
//! These options also only apply to the call once.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use echo_meta::{client::CallOpt, HelloRequest};
//!
//! let callopt = CallOpt::new()
//!     .with_rpc_timeout(Duration::from_millis(500))
//!     .with_metadata("timestamp", "set by the application");
//! let resp = client
//!     .unary_echo_with_callopt(HelloRequest::new("unaryCall"), callopt)
//!     .await?;
//! ```

use std::time::Duration;

use faststr::FastStr;

use crate::{context::Config, metadata::MetadataMap};

#[derive(Debug, Default, Clone)]
pub struct CallOpt {
    /// Merged over the client's config for this call.
    pub config: Config,
    /// Appended to the request metadata of this call.
    pub metadata: MetadataMap,
}

impl CallOpt {
    /// Creates a new [`CallOpt`].
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.set_rpc_timeout(Some(timeout));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.metadata.append(key, value);
        self
    }
}
