// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type and its stable error
//! codes.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// `Error` enumerates all errors reported by Resona.
///
/// Errors are plain values. A decoder latches the first error it observes and
/// reports it to the caller; there is no hidden propagation channel. Each
/// variant maps to a stable numeric code via [`Error::code`].
#[derive(Debug)]
pub enum Error {
    /// An IO error occurred while reading or seeking the byte source.
    IoError(io::Error),
    /// More input is required before decoding can continue (push mode only).
    NeedMoreData,
    /// A pull-mode operation was invoked on a push-mode handle, or vice-versa.
    InvalidApiMixing,
    /// An internal allocation limit was exceeded during setup.
    OutOfMemory,
    /// The stream uses a feature this decoder does not implement.
    FeatureNotSupported(&'static str),
    /// The stream declares more channels than the compiled-in channel cap.
    TooManyChannels,
    /// The byte source could not be opened.
    FileOpenFailure,
    /// The total length of the stream is unknown, so it cannot be seeked.
    SeekWithoutLength,
    /// The stream ended prematurely.
    UnexpectedEof,
    /// The seek target lies beyond the end of the stream.
    SeekInvalid,
    /// The setup headers are malformed.
    InvalidSetup(&'static str),
    /// An audio packet or page payload is malformed.
    InvalidStream(&'static str),
    /// The page capture pattern was not found where a page was required.
    MissingCapturePattern,
    /// A page declared a stream structure version other than 0.
    InvalidStreamStructureVersion,
    /// A page's continued-packet flag contradicts the current packet state.
    ContinuedPacketFlagInvalid,
    /// A page belongs to a different logical stream.
    IncorrectStreamSerialNumber,
    /// The first page is not a valid stream start.
    InvalidFirstPage(&'static str),
    /// A packet of an unexpected type was encountered.
    BadPacketType,
    /// The final page of the stream could not be located.
    CantFindLastPage,
    /// A seek operation failed. The decoder was rewound to the stream start
    /// and sequential decoding may continue.
    SeekFailed,
}

impl Error {
    /// Gets the stable numeric code for this error.
    ///
    /// The codes match the error enumeration of the reference decoder and do
    /// not change between releases. `0` is reserved for "no error".
    pub fn code(&self) -> u32 {
        match self {
            Error::NeedMoreData => 1,
            Error::InvalidApiMixing => 2,
            Error::OutOfMemory => 3,
            Error::FeatureNotSupported(_) => 4,
            Error::TooManyChannels => 5,
            Error::FileOpenFailure => 6,
            Error::SeekWithoutLength => 7,
            Error::IoError(_) | Error::UnexpectedEof => 10,
            Error::SeekInvalid => 11,
            Error::InvalidSetup(_) => 20,
            Error::InvalidStream(_) => 21,
            Error::MissingCapturePattern => 30,
            Error::InvalidStreamStructureVersion => 31,
            Error::ContinuedPacketFlagInvalid => 32,
            Error::IncorrectStreamSerialNumber => 33,
            Error::InvalidFirstPage(_) => 34,
            Error::BadPacketType => 35,
            Error::CantFindLastPage => 36,
            Error::SeekFailed => 37,
        }
    }

    /// Returns true if this error was caused by the bitstream ending early
    /// within a packet. Some decode stages are permitted to terminate on this
    /// condition without failing the packet.
    pub fn is_end_of_packet(&self) -> bool {
        matches!(self, Error::IoError(e) if e.kind() == io::ErrorKind::Other)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "io error: {}", err),
            Error::NeedMoreData => write!(f, "more data required"),
            Error::InvalidApiMixing => write!(f, "pull and push api calls were mixed"),
            Error::OutOfMemory => write!(f, "allocation limit exceeded"),
            Error::FeatureNotSupported(feature) => {
                write!(f, "unsupported feature: {}", feature)
            }
            Error::TooManyChannels => write!(f, "channel count exceeds the compiled-in cap"),
            Error::FileOpenFailure => write!(f, "could not open the byte source"),
            Error::SeekWithoutLength => write!(f, "cannot seek a stream of unknown length"),
            Error::UnexpectedEof => write!(f, "unexpected end of stream"),
            Error::SeekInvalid => write!(f, "seek target is past the end of the stream"),
            Error::InvalidSetup(msg) => write!(f, "malformed setup: {}", msg),
            Error::InvalidStream(msg) => write!(f, "malformed stream: {}", msg),
            Error::MissingCapturePattern => write!(f, "missing page capture pattern"),
            Error::InvalidStreamStructureVersion => {
                write!(f, "invalid stream structure version")
            }
            Error::ContinuedPacketFlagInvalid => write!(f, "continued packet flag invalid"),
            Error::IncorrectStreamSerialNumber => write!(f, "incorrect stream serial number"),
            Error::InvalidFirstPage(msg) => write!(f, "invalid first page: {}", msg),
            Error::BadPacketType => write!(f, "bad packet type"),
            Error::CantFindLastPage => write!(f, "cannot find the last page"),
            Error::SeekFailed => write!(f, "seek failed"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            _ => Error::IoError(err),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Convenience function to create a malformed-stream error.
pub fn decode_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::InvalidStream(msg))
}

/// Convenience function to create a malformed-setup error.
pub fn setup_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::InvalidSetup(msg))
}

/// Convenience function to create an unsupported-feature error.
pub fn unsupported_error<T>(feature: &'static str) -> Result<T> {
    Err(Error::FeatureNotSupported(feature))
}

/// Convenience function to create an end-of-stream error.
pub fn end_of_stream_error<T>() -> Result<T> {
    Err(Error::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn verify_stable_codes() {
        assert_eq!(Error::NeedMoreData.code(), 1);
        assert_eq!(Error::UnexpectedEof.code(), 10);
        assert_eq!(Error::InvalidSetup("x").code(), 20);
        assert_eq!(Error::InvalidStream("x").code(), 21);
        assert_eq!(Error::MissingCapturePattern.code(), 30);
        assert_eq!(Error::SeekFailed.code(), 37);
    }

    #[test]
    fn verify_end_of_packet_classification() {
        let eop = Error::IoError(std::io::Error::new(std::io::ErrorKind::Other, "end"));
        assert!(eop.is_end_of_packet());

        let eof = Error::UnexpectedEof;
        assert!(!eof.is_end_of_packet());
    }
}
