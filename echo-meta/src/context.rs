use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Local};
use faststr::FastStr;
use parking_lot::Mutex;
use paste::paste;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{metadata::MetadataMap, transport::Cancellation, Status};

macro_rules! stat_impl {
    ($t: ident) => {
        paste! {
            #[inline]
            pub fn $t(&self) -> Option<DateTime<Local>> {
                self.$t
            }

            #[doc(hidden)]
            #[inline]
            pub fn [<set_$t>](&mut self, t: DateTime<Local>) {
                self.$t = Some(t)
            }

            #[inline]
            pub fn [<record_ $t>](&mut self) {
                self.$t = Some(Local::now())
            }
        }
    };
}

#[derive(Debug, Default, Clone)]
pub struct ClientStats {
    call_start_at: Option<DateTime<Local>>,
    call_end_at: Option<DateTime<Local>>,
    header_received_at: Option<DateTime<Local>>,
}

impl ClientStats {
    stat_impl!(call_start_at);
    stat_impl!(call_end_at);
    stat_impl!(header_received_at);
}

#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    process_start_at: Option<DateTime<Local>>,
    process_end_at: Option<DateTime<Local>>,
}

impl ServerStats {
    stat_impl!(process_start_at);
    stat_impl!(process_end_at);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Which directions of a call carry a sequence of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallShape {
    /// Whether the client may send more than one message.
    pub fn client_push(self) -> bool {
        matches!(self, CallShape::ClientStreaming | CallShape::Bidirectional)
    }

    /// Whether the server may send more than one message.
    pub fn server_push(self) -> bool {
        matches!(self, CallShape::ServerStreaming | CallShape::Bidirectional)
    }
}

/// A full method path bound to its call shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub path: &'static str,
    pub shape: CallShape,
}

impl MethodDescriptor {
    pub const fn new(path: &'static str, shape: CallShape) -> Self {
        Self { path, shape }
    }
}

#[derive(Debug, Clone)]
pub struct RpcInfo {
    role: Role,
    method: FastStr,
    shape: CallShape,
}

impl RpcInfo {
    pub fn new(role: Role, method: impl Into<FastStr>, shape: CallShape) -> Self {
        Self {
            role,
            method: method.into(),
            shape,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn method(&self) -> &FastStr {
        &self.method
    }

    #[inline]
    pub fn shape(&self) -> CallShape {
        self.shape
    }
}

const DEFAULT_STREAM_BUFFER: usize = 64;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) rpc_timeout: Option<Duration>,
    /// Capacity of each message channel of a call.
    pub(crate) stream_buffer: Option<usize>,
}

impl Config {
    pub fn merge(&mut self, other: Self) {
        if let Some(t) = other.rpc_timeout {
            self.rpc_timeout = Some(t);
        }
        if let Some(n) = other.stream_buffer {
            self.stream_buffer = Some(n);
        }
    }

    #[inline]
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout
    }

    /// Sets the rpc timeout.
    ///
    /// This can be set both by the client builder and the CallOpt.
    #[inline]
    pub fn set_rpc_timeout(&mut self, rpc_timeout: Option<Duration>) {
        self.rpc_timeout = rpc_timeout;
    }

    #[inline]
    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer.unwrap_or(DEFAULT_STREAM_BUFFER).max(1)
    }

    #[inline]
    pub fn set_stream_buffer(&mut self, stream_buffer: Option<usize>) {
        self.stream_buffer = stream_buffer;
    }
}

/// A context for client to pass information such as `RpcInfo` and `Config` between middleware
/// during the rpc call lifecycle.
///
/// The outgoing metadata is recorded once the request has been handed to the transport and is
/// read-only from then on. Header and trailer are filled in by unary calls as they arrive.
#[derive(Debug)]
pub struct ClientContext {
    rpc_info: RpcInfo,
    config: Config,
    pub stats: ClientStats,
    outgoing: Option<MetadataMap>,
    header: Option<MetadataMap>,
    trailer: Option<MetadataMap>,
}

impl ClientContext {
    pub fn new(rpc_info: RpcInfo, config: Config) -> Self {
        Self {
            rpc_info,
            config,
            stats: ClientStats::default(),
            outgoing: None,
            header: None,
            trailer: None,
        }
    }

    #[inline]
    pub fn rpc_info(&self) -> &RpcInfo {
        &self.rpc_info
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// The request metadata as it was sent.
    pub fn outgoing_metadata(&self) -> Option<&MetadataMap> {
        self.outgoing.as_ref()
    }

    pub fn header(&self) -> Option<&MetadataMap> {
        self.header.as_ref()
    }

    pub fn trailer(&self) -> Option<&MetadataMap> {
        self.trailer.as_ref()
    }

    pub(crate) fn record_outgoing(&mut self, metadata: MetadataMap) {
        self.outgoing = Some(metadata);
    }

    pub(crate) fn record_header(&mut self, header: Option<MetadataMap>) {
        if header.is_some() {
            self.stats.record_header_received_at();
        }
        self.header = header;
    }

    pub(crate) fn record_trailer(&mut self, trailer: Option<MetadataMap>) {
        self.trailer = trailer;
    }
}

/// Where the response side of a call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Created,
    HeaderSent,
    Exchanging,
    Completed,
}

#[derive(Debug)]
struct HeadState {
    pending: MetadataMap,
    tx: Option<oneshot::Sender<MetadataMap>>,
    phase: CallPhase,
}

/// The server side of a call's header: collects header metadata until it is sent, and sends it
/// at most once.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    inner: Arc<Mutex<HeadState>>,
}

impl ResponseHead {
    pub(crate) fn new(tx: oneshot::Sender<MetadataMap>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeadState {
                pending: MetadataMap::new(),
                tx: Some(tx),
                phase: CallPhase::Created,
            })),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.lock().phase
    }

    /// Adds metadata to the pending header.
    pub fn set_header(&self, metadata: MetadataMap) -> Result<(), Status> {
        let mut state = self.inner.lock();
        if state.tx.is_none() {
            return Err(Status::internal("header already sent"));
        }
        state.pending.merge(metadata);
        Ok(())
    }

    /// Adds metadata to the pending header and sends it.
    pub fn send_header(&self, metadata: MetadataMap) -> Result<(), Status> {
        let mut state = self.inner.lock();
        if state.tx.is_none() {
            return Err(Status::internal("header already sent"));
        }
        state.pending.merge(metadata);
        Self::send_locked(&mut state);
        Ok(())
    }

    /// Called before the first response message goes out.
    pub(crate) fn start_exchange(&self) {
        let mut state = self.inner.lock();
        Self::send_locked(&mut state);
        state.phase = CallPhase::Exchanging;
    }

    /// Successful calls always deliver a header; failed calls that never sent one end up
    /// trailers-only.
    pub(crate) fn complete(&self, success: bool) {
        let mut state = self.inner.lock();
        if success {
            Self::send_locked(&mut state);
        } else if state.tx.take().is_some() {
            trace!("[ECHO] call failed before the header was sent, responding trailers-only");
        }
        state.phase = CallPhase::Completed;
    }

    fn send_locked(state: &mut HeadState) {
        if let Some(tx) = state.tx.take() {
            if tx.send(std::mem::take(&mut state.pending)).is_err() {
                trace!("[ECHO] header receiver dropped");
            }
            if state.phase == CallPhase::Created {
                state.phase = CallPhase::HeaderSent;
            }
        }
    }
}

/// Trailer metadata accumulated over a call, sent with the terminal status.
#[derive(Debug, Clone, Default)]
pub struct TrailerSlot(Arc<Mutex<MetadataMap>>);

impl TrailerSlot {
    pub fn merge(&self, metadata: MetadataMap) {
        self.0.lock().merge(metadata);
    }

    pub(crate) fn take(&self) -> MetadataMap {
        std::mem::take(&mut *self.0.lock())
    }
}

/// A context for server to pass information such as `RpcInfo` and the call's metadata between
/// middleware during the rpc call lifecycle.
#[derive(Debug)]
pub struct ServerContext {
    rpc_info: RpcInfo,
    pub stats: ServerStats,
    incoming: Option<MetadataMap>,
    head: ResponseHead,
    trailer: TrailerSlot,
    cancellation: Cancellation,
}

impl ServerContext {
    pub(crate) fn new(
        rpc_info: RpcInfo,
        incoming: Option<MetadataMap>,
        head: ResponseHead,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            rpc_info,
            stats: ServerStats::default(),
            incoming,
            head,
            trailer: TrailerSlot::default(),
            cancellation,
        }
    }

    #[inline]
    pub fn rpc_info(&self) -> &RpcInfo {
        &self.rpc_info
    }

    /// The request metadata, or `None` if the transport supplied no container.
    pub fn incoming_metadata(&self) -> Option<&MetadataMap> {
        self.incoming.as_ref()
    }

    /// Adds metadata to the header without sending it.
    pub fn set_header(&self, metadata: MetadataMap) -> Result<(), Status> {
        self.head.set_header(metadata)
    }

    /// Sends the header now. Fails if it was already sent.
    pub fn send_header(&self, metadata: MetadataMap) -> Result<(), Status> {
        self.head.send_header(metadata)
    }

    /// Adds metadata to the trailer.
    pub fn set_trailer(&self, metadata: MetadataMap) {
        self.trailer.merge(metadata)
    }

    pub fn trailer_slot(&self) -> &TrailerSlot {
        &self.trailer
    }

    pub fn response_head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn phase(&self) -> CallPhase {
        self.head.phase()
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}
