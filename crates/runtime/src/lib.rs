//! The Librarian: a background research and ingestion service reached over
//! a length-prefixed JSON protocol on a local TCP socket.

mod client;
pub mod protocol;
mod server;
pub mod wire;

pub use client::{ClientError, ClientOptions, LibrarianClient, NotificationListener, split_chunks};
pub use protocol::{
    ErrorCode, Notification, NotificationEvent, PROTOCOL_VERSION, Request, Response,
    ResponseStatus,
};
pub use server::{
    AssembledText, CallbackSink, ChunkError, ChunkProgress, ChunkTable, Collaborators,
    DisabledSink, GapHistory, Librarian, LibrarianServer, NotificationSink, PolicySnapshot,
    Rejection, ResiliencePolicy, SharedSink, SourcesRecord, UpkeepReport, UpkeepState,
    parse_sources, run_librarian, sink_for, trust_score,
};

/// In-memory collaborators for driving a `Librarian` from tests.
#[cfg(any(test, feature = "test-util"))]
pub use server::RecordingSink;
