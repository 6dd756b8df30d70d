pub mod engine;
pub mod raft;
pub mod session;

pub use engine::{ElectionEngine, ElectionListener, ElectionTiming, EngineContext, EngineRegistry};
pub use session::ElectionSession;
