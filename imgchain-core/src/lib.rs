pub mod apply;
pub mod chain;
pub mod digest;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod naming;
pub mod progress;
pub mod session;
pub mod stream;
pub mod target;
pub mod verify;

pub use chain::{resolve, BackupChain, ChainSource, ResolveOptions, ResolvedSet};
pub use dispatch::{execute, Action, Collaborators, Outcome};
pub use error::{ChainError, Error, Result};
pub use naming::{BackupFile, BackupKind};
pub use session::{CancelToken, ReconstructionSession, SessionOptions};
pub use stream::{DecodeLimits, FrameReader, StreamFrame, StreamMetadata, StreamWriter};
pub use target::{DiskTarget, TargetFormat};
pub use verify::{verify, verify_image, VerificationReport};
