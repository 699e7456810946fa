use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// The transport task is gone; nothing can be published any more.
    #[error("Transport command channel closed")]
    ChannelClosed,

    /// Encoding or decoding a packet failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
