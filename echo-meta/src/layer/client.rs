use faststr::FastStr;
use motore::{layer::Layer, service::Service};
use serde::Serialize;

use crate::{
    client::ClientStream,
    context::ClientContext,
    error::{Error, MetadataSection},
    metadata::{timestamp, MetadataMap, LOCATION_KEY, TIMESTAMP_KEY},
    Request, Response,
};

/// The metadata keys a client requires the server to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataContract {
    header: Vec<FastStr>,
    trailer: Vec<FastStr>,
}

impl MetadataContract {
    /// A contract that requires nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// `timestamp` and `location` in the header, `timestamp` in the trailer.
    pub fn echo() -> Self {
        Self::new()
            .require_header(TIMESTAMP_KEY)
            .require_header(LOCATION_KEY)
            .require_trailer(TIMESTAMP_KEY)
    }

    pub fn require_header(mut self, key: impl Into<FastStr>) -> Self {
        self.header.push(key.into());
        self
    }

    pub fn require_trailer(mut self, key: impl Into<FastStr>) -> Self {
        self.trailer.push(key.into());
        self
    }

    pub fn verify_header(&self, header: Option<&MetadataMap>) -> Result<(), Error> {
        verify(&self.header, header, MetadataSection::Header)
    }

    pub fn verify_trailer(&self, trailer: Option<&MetadataMap>) -> Result<(), Error> {
        verify(&self.trailer, trailer, MetadataSection::Trailer)
    }
}

fn verify(
    keys: &[FastStr],
    metadata: Option<&MetadataMap>,
    section: MetadataSection,
) -> Result<(), Error> {
    for key in keys {
        let Some(values) = metadata.and_then(|md| md.get(key)) else {
            return Err(Error::required(key.clone(), section));
        };
        tracing::debug!("[ECHO] {key} from {section}:");
        for (i, value) in values.iter().enumerate() {
            tracing::debug!("[ECHO]  {i}. {value}");
        }
    }
    Ok(())
}

fn payload<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

/// Stamps unary requests and checks the header and trailer of successful calls.
#[derive(Debug, Clone)]
pub struct ClientUnaryLayer {
    contract: MetadataContract,
}

impl ClientUnaryLayer {
    pub fn new() -> Self {
        Self {
            contract: MetadataContract::echo(),
        }
    }

    pub fn contract(mut self, contract: MetadataContract) -> Self {
        self.contract = contract;
        self
    }
}

impl Default for ClientUnaryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ClientUnaryLayer {
    type Service = ClientUnaryService<S>;

    fn layer(self, inner: S) -> Self::Service {
        ClientUnaryService {
            inner,
            contract: self.contract,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientUnaryService<S> {
    inner: S,
    contract: MetadataContract,
}

impl<S, Req, Resp> Service<ClientContext, Request<Req>> for ClientUnaryService<S>
where
    S: Service<ClientContext, Request<Req>, Response = Response<Resp>, Error = Error>
        + Send
        + Sync,
    Req: Serialize + Send,
{
    type Response = Response<Resp>;
    type Error = Error;

    async fn call(
        &self,
        cx: &mut ClientContext,
        mut req: Request<Req>,
    ) -> Result<Self::Response, Self::Error> {
        req.metadata_mut().append(TIMESTAMP_KEY, timestamp());
        tracing::info!(
            "[ECHO] unary call {} with payload {}",
            cx.rpc_info().method(),
            payload(req.get_ref())
        );

        // Failed calls propagate unchanged.
        let resp = self.inner.call(cx, req).await?;

        self.contract.verify_header(cx.header())?;
        self.contract.verify_trailer(cx.trailer())?;
        Ok(resp)
    }
}

/// Stamps stream requests and attaches the metadata contract to the opened stream, which checks
/// the header when it arrives and the trailer once the stream is drained.
#[derive(Debug, Clone)]
pub struct ClientStreamLayer {
    contract: MetadataContract,
}

impl ClientStreamLayer {
    pub fn new() -> Self {
        Self {
            contract: MetadataContract::echo(),
        }
    }

    pub fn contract(mut self, contract: MetadataContract) -> Self {
        self.contract = contract;
        self
    }
}

impl Default for ClientStreamLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ClientStreamLayer {
    type Service = ClientStreamService<S>;

    fn layer(self, inner: S) -> Self::Service {
        ClientStreamService {
            inner,
            contract: self.contract,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientStreamService<S> {
    inner: S,
    contract: MetadataContract,
}

impl<S, Req, Resp> Service<ClientContext, Request<Option<Req>>> for ClientStreamService<S>
where
    S: Service<
            ClientContext,
            Request<Option<Req>>,
            Response = ClientStream<Req, Resp>,
            Error = Error,
        > + Send
        + Sync,
    Req: Serialize + Send,
{
    type Response = ClientStream<Req, Resp>;
    type Error = Error;

    async fn call(
        &self,
        cx: &mut ClientContext,
        mut req: Request<Option<Req>>,
    ) -> Result<Self::Response, Self::Error> {
        req.metadata_mut().append(TIMESTAMP_KEY, timestamp());
        match req.get_ref() {
            Some(message) => tracing::info!(
                "[ECHO] opening stream {} with payload {}",
                cx.rpc_info().method(),
                payload(message)
            ),
            None => tracing::info!("[ECHO] opening stream {}", cx.rpc_info().method()),
        }

        let stream = self.inner.call(cx, req).await?;
        Ok(stream.with_contract(self.contract.clone()))
    }
}
