// Core types and traits for the streamplay audio engine

pub mod callback;
pub mod error;
pub mod format;
pub mod parser;
pub mod source;
pub mod state;

// Re-export commonly used types
pub use callback::{EventDispatcher, PlayerEvent, PlayerListener, QueueItemId, Subscription};
pub use error::{AudioError, ErrorCode, Result};
pub use format::{BufferId, PacketDescription, SampleEncoding, StreamFormat};
pub use parser::{AudioDataLayout, ParserEvent, ParserFactory, StreamParser};
pub use source::{CancelFlag, DataSource};
pub use state::{InternalState, PlayerStateMachine, PublicState, StateFlags, StopReason, Transition};
