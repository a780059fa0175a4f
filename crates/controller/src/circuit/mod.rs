//! Circuit engine and terminator strategies.

pub mod engine;
pub mod sequence;
pub mod strategy;

pub use engine::{
    Circuit, CircuitEngine, CreateCircuitParams, EngineConfig, Path, SMART_REROUTE_ATTEMPT,
};
pub use sequence::IdSequence;
pub use strategy::{CostedTerminator, StrategyEvent, StrategyRegistry, TerminatorStrategy};
