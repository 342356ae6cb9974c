use crate::peer::AddPeerError;

/// Errors surfaced by the mediator's own public operations.
///
/// Most failure conditions are modelled as a return value (`Option`, a
/// `WriteOutcome` variant, a bool) rather than this enum - see the
/// per-operation docs on [`crate::mediator::DownloadManager`]. This type
/// exists for the handful of misuses that don't have a natural in-band
/// return, such as calling an operation before the required collaborator
/// has been installed.
#[derive(thiserror::Error, Debug)]
pub enum DmError {
    #[error("no callbacks installed, call set_callbacks() first")]
    CallbacksNotSet,

    #[error("piece db not installed, call set_piece_db() first")]
    PieceDbNotSet,

    #[error("piece selector not installed, call set_piece_selector() first")]
    SelectorNotSet,

    #[error("protocol factory not installed, call set_protocol_factory() first")]
    ProtocolFactoryNotSet,

    #[error(transparent)]
    AddPeer(#[from] AddPeerError),
}

pub type Result<T> = std::result::Result<T, DmError>;
