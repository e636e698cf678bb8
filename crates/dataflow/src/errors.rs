use crate::semaphore::SemaphoreError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("invalid node name {0:?}")]
    InvalidName(String),

    #[error("payload capacity must be non-zero")]
    ZeroPayload,

    #[error("segment for node {name:?} holds {have} bytes but {need} are required")]
    TooSmall { name: String, have: u64, need: u64 },

    #[error("bad magic or version in segment for node {0:?}")]
    Corrupt(String),

    #[error("payload descriptor is invalid: {0}")]
    BadParams(&'static str),

    #[error("node {0:?} already has a bound sink")]
    AlreadyBound(String),

    #[error("node {0:?} is not bound by a sink")]
    NotBound(String),

    #[error("all {0} source slots are taken")]
    Saturated(u32),

    #[error("attach window is closed on a statically-membered node")]
    AttachClosed,

    #[error("no sample is held; wait() must succeed before retrieve()/post()")]
    NoSample,

    #[error("slot was reclaimed by the sink")]
    SlotReclaimed,

    #[error("sink has left the stream")]
    EndOfStream,

    #[error("semaphore failure: {0}")]
    Semaphore(#[from] SemaphoreError),

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = NodeError::InvalidName("9bad".to_string());
        assert_eq!(err.to_string(), "invalid node name \"9bad\"");

        let err = NodeError::Saturated(10);
        assert_eq!(err.to_string(), "all 10 source slots are taken");

        let err = NodeError::TooSmall {
            name: "frames".to_string(),
            have: 256,
            need: 1024,
        };
        assert_eq!(
            err.to_string(),
            "segment for node \"frames\" holds 256 bytes but 1024 are required"
        );
    }

    #[test]
    fn test_error_conversion_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: NodeError = io_err.into();

        match err {
            NodeError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            _ => panic!("Expected Io variant"),
        }
    }
}
