use std::fmt;

use faststr::FastStr;

use crate::status::{Code, Status};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which part of a response a piece of metadata was expected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSection {
    Header,
    Trailer,
}

impl fmt::Display for MetadataSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataSection::Header => f.write_str("header"),
            MetadataSection::Trailer => f.write_str("trailer"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The transport handed the server no metadata container at all.
    #[error("failed to get metadata")]
    MetadataUnavailable,
    /// A handler was reached without incoming metadata.
    #[error("handler reached without incoming metadata")]
    MetadataMissing,
    #[error("{key} expected but doesn't exist in {section}")]
    RequiredMetadataMissing {
        key: FastStr,
        section: MetadataSection,
    },
    /// The stream ended with a non-OK status.
    #[error("stream terminated: {0}")]
    StreamTerminal(Status),
    #[error("failed to send to peer: {0}")]
    PeerSendFailure(Status),
    #[error("no requests received before end of stream")]
    NoRequestsReceived,
    #[error(transparent)]
    Status(#[from] Status),
}

impl Error {
    pub fn required(key: impl Into<FastStr>, section: MetadataSection) -> Self {
        Error::RequiredMetadataMissing {
            key: key.into(),
            section,
        }
    }

    /// The status code this error is reported with on the wire.
    pub fn code(&self) -> Code {
        match self {
            Error::MetadataUnavailable => Code::DataLoss,
            Error::MetadataMissing => Code::Internal,
            Error::RequiredMetadataMissing { .. } => Code::FailedPrecondition,
            Error::NoRequestsReceived => Code::InvalidArgument,
            Error::StreamTerminal(status)
            | Error::PeerSendFailure(status)
            | Error::Status(status) => status.code(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::StreamTerminal(status)
            | Error::PeerSendFailure(status)
            | Error::Status(status) => status,
            Error::MetadataUnavailable => Status::data_loss(message),
            Error::MetadataMissing => Status::internal(message),
            Error::RequiredMetadataMissing { .. } => Status::failed_precondition(message),
            Error::NoRequestsReceived => Status::invalid_argument(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(Error::MetadataUnavailable.code(), Code::DataLoss);
        assert_eq!(Error::MetadataMissing.code(), Code::Internal);
        assert_eq!(Error::NoRequestsReceived.code(), Code::InvalidArgument);
        assert_eq!(
            Error::required("location", MetadataSection::Header).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            Error::StreamTerminal(Status::deadline_exceeded("late")).code(),
            Code::DeadlineExceeded
        );
    }

    #[test]
    fn into_status_keeps_peer_status() {
        let status: Status = Error::PeerSendFailure(Status::unavailable("gone")).into();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "gone");

        let status: Status = Error::MetadataUnavailable.into();
        assert_eq!(status.code(), Code::DataLoss);
        assert_eq!(status.message(), "failed to get metadata");

        let status: Status = Error::MetadataMissing.into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "handler reached without incoming metadata");

        let status: Status = Error::required("location", MetadataSection::Header).into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.message(), "location expected but doesn't exist in header");
    }

    #[test]
    fn required_metadata_message() {
        let err = Error::required("timestamp", MetadataSection::Trailer);
        assert_eq!(err.to_string(), "timestamp expected but doesn't exist in trailer");
    }
}
