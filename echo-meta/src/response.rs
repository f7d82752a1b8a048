use crate::metadata::MetadataMap;

/// A response message with the header metadata sent before it and the trailer metadata that
/// terminated the call.
///
/// On the server, `metadata` is merged into the header when the header is still pending and
/// `trailers` into the trailer. On the client both are filled from what the peer sent.
#[derive(Debug, Clone, Default)]
pub struct Response<T> {
    metadata: MetadataMap,
    trailers: MetadataMap,
    message: T,
}

impl<T> Response<T> {
    pub fn new(message: T) -> Self {
        Self {
            metadata: MetadataMap::new(),
            trailers: MetadataMap::new(),
            message,
        }
    }

    /// Get a immutable reference to `T`.
    pub fn get_ref(&self) -> &T {
        &self.message
    }

    /// Get a mutable reference to the message
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.message
    }

    /// Get a reference to the header metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Get a reference to the trailer metadata.
    pub fn trailers(&self) -> &MetadataMap {
        &self.trailers
    }

    pub fn trailers_mut(&mut self) -> &mut MetadataMap {
        &mut self.trailers
    }

    /// Consumes `self`, returning the message
    pub fn into_inner(self) -> T {
        self.message
    }

    pub fn into_parts(self) -> (MetadataMap, MetadataMap, T) {
        (self.metadata, self.trailers, self.message)
    }

    pub fn from_parts(metadata: MetadataMap, trailers: MetadataMap, message: T) -> Self {
        Self {
            metadata,
            trailers,
            message,
        }
    }

    pub fn map<F, U>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            metadata: self.metadata,
            trailers: self.trailers,
            message: f(self.message),
        }
    }
}
