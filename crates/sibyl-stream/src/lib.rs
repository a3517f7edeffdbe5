//! Streaming response protocol engine.
//!
//! Consumes the answer producer's chunked, event-tagged push stream:
//! reassembles frames split across chunk boundaries, dispatches typed
//! events, extracts and deduplicates inline citations, and reduces the
//! whole stream into one finalized, persisted assistant message.

pub mod decoder;
pub mod error;
pub mod event;
pub mod session;
pub mod sources;
pub mod transport;

pub use decoder::FrameDecoder;
pub use error::StreamError;
pub use event::{DonePayload, RawReference, StreamEvent};
pub use session::{
    AbortHandle, CloseReason, SessionOptions, SessionOutcome, SessionState, SessionUpdate,
    StreamSession,
};
pub use sources::{extract_sources, ExtractedSource, Extraction};
pub use transport::{ByteStream, HttpTransport, QueryRequest, StreamTransport};
