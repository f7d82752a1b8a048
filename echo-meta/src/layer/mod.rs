//! Interceptors that attach and check the call metadata on both ends.

pub mod client;
pub mod server;

pub use self::{
    client::{ClientStreamLayer, ClientUnaryLayer, MetadataContract},
    server::ServerMetadataLayer,
};
