use std::fmt::Debug;

use faststr::FastStr;
use motore::{layer::Layer, service::Service};

use crate::{
    context::ServerContext,
    error::Error,
    metadata::{timestamp, MetadataMap, DEFAULT_LOCATION, LOCATION_KEY, TIMESTAMP_KEY},
    Request,
};

/// Reads the incoming metadata, sends the header and schedules the trailer of every call.
///
/// Calls whose transport produced no metadata container fail with `DataLoss` before the handler
/// runs, without header or trailer. Otherwise a trailer `timestamp` taken at entry is merged into
/// the call's trailer however the call ends, including when its future is dropped.
#[derive(Debug, Clone)]
pub struct ServerMetadataLayer {
    location: FastStr,
}

impl ServerMetadataLayer {
    pub fn new() -> Self {
        Self {
            location: FastStr::from_static_str(DEFAULT_LOCATION),
        }
    }

    /// Sets the `location` sent in every header.
    pub fn location(mut self, location: impl Into<FastStr>) -> Self {
        self.location = location.into();
        self
    }
}

impl Default for ServerMetadataLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ServerMetadataLayer {
    type Service = ServerMetadataService<S>;

    fn layer(self, inner: S) -> Self::Service {
        ServerMetadataService {
            inner,
            location: self.location,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerMetadataService<S> {
    inner: S,
    location: FastStr,
}

impl<S, T> Service<ServerContext, Request<T>> for ServerMetadataService<S>
where
    S: Service<ServerContext, Request<T>> + Send + Sync,
    S::Error: From<Error> + Debug,
    T: Send,
{
    type Response = S::Response;
    type Error = S::Error;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<T>,
    ) -> Result<Self::Response, Self::Error> {
        let method = cx.rpc_info().method().clone();
        let Some(incoming) = cx.incoming_metadata() else {
            tracing::warn!("[ECHO] {method}: failed to get metadata");
            return Err(Error::MetadataUnavailable.into());
        };
        match incoming.get(TIMESTAMP_KEY) {
            Some(values) => {
                tracing::debug!("[ECHO] {method}: timestamp from metadata:");
                for (i, value) in values.iter().enumerate() {
                    tracing::debug!("[ECHO]  {i}. {value}");
                }
            }
            None => {
                tracing::debug!("[ECHO] {method}: timestamp expected but doesn't exist in metadata")
            }
        }

        let slot = cx.trailer_slot().clone();
        let _trailer = scopeguard::guard(timestamp(), move |ts| {
            slot.merge(MetadataMap::from_pairs([(TIMESTAMP_KEY, ts)]));
        });

        let mut header = MetadataMap::new();
        header.append(LOCATION_KEY, self.location.clone());
        header.append(TIMESTAMP_KEY, timestamp());
        cx.send_header(header).map_err(Error::from)?;

        let result = self.inner.call(cx, req).await;
        match &result {
            Ok(_) => tracing::debug!("[ECHO] {method}: handler returned"),
            Err(e) => tracing::debug!("[ECHO] {method}: handler failed: {e:?}"),
        }
        result
    }
}
