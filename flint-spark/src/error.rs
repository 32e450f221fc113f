//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::warn;

use crate::packet::DecodeError;

// Spark errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Engine lifecycle
    EngineClosed,
    InvalidAreaRegex(regex::Error),
    // Packet input
    PacketDecodeError(DecodeError),
    DomainMismatch(String, String),
    VersionMismatch(String, u32),
    AreaMismatch(String),
    SubnetMismatch(String),
    NegotiationFailure(String),
}

// Spark I/O errors.
#[derive(Debug)]
pub enum IoError {
    BindError(std::io::Error),
    SendError(std::io::Error),
    RecvError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::EngineClosed => {
                warn!("{}", self);
            }
            Error::InvalidAreaRegex(error) => {
                warn!(%error, "{}", self);
            }
            Error::PacketDecodeError(error) => {
                warn!(%error, "{}", self);
            }
            Error::DomainMismatch(node_name, domain_name) => {
                warn!(%node_name, %domain_name, "{}", self);
            }
            Error::VersionMismatch(node_name, version) => {
                warn!(%node_name, %version, "{}", self);
            }
            Error::AreaMismatch(node_name)
            | Error::SubnetMismatch(node_name)
            | Error::NegotiationFailure(node_name) => {
                warn!(%node_name, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::EngineClosed => {
                write!(f, "engine is no longer running")
            }
            Error::InvalidAreaRegex(..) => {
                write!(f, "invalid area regular expression")
            }
            Error::PacketDecodeError(..) => {
                write!(f, "failed to decode packet")
            }
            Error::DomainMismatch(..) => {
                write!(f, "hello from foreign domain")
            }
            Error::VersionMismatch(..) => {
                write!(f, "unsupported protocol version")
            }
            Error::AreaMismatch(..) => {
                write!(f, "no matching area for neighbor")
            }
            Error::SubnetMismatch(..) => {
                write!(f, "neighbor address not in the interface subnet")
            }
            Error::NegotiationFailure(..) => {
                write!(f, "adjacency negotiation failed")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::PacketDecodeError(error) => Some(error),
            Error::InvalidAreaRegex(error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::BindError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => {
                warn!(%error, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::BindError(..) => {
                write!(f, "failed to bind interface")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send packet")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive packet")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::BindError(error)
            | IoError::SendError(error)
            | IoError::RecvError(error) => Some(error),
        }
    }
}
