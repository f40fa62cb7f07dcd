pub mod assembler;
pub mod cache;
pub mod session;

pub use assembler::{
    Assembler, AssemblerState, AssemblerUpdate, TurnError, TurnOutcome, TRANSPORT_ERROR_MESSAGE,
};
pub use cache::DataCache;
pub use session::{
    Author, ChatEntry, ChatSession, EntryStatus, FinishedTurn, PendingTurn,
    DATA_UNAVAILABLE_NOTICE,
};
