//! Domain Layer
//!
//! Trait abstractions (ports) the value log offers to the engine and
//! depends on for transport.
//!
//! # Usage
//!
//! ```ignore
//! use cachelog::domain::{LiveIndex, ValueLog};
//!
//! // The engine owns its backend and stays generic over it
//! struct Engine<V: ValueLog> {
//!     vlog: V,
//! }
//! ```

pub mod ports;

pub use ports::{CacheTransport, LiveIndex, QuietFailure, ReplayVisitor, RetainAll, ValueLog};
