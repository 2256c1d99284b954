//! Reliability decorators. Each wraps one duplex channel (output or input side) and implements
//!  the same contract it consumes, adding exactly one guarantee - so any number of them stack
//!  in any order, e.g. authenticated over buffered over a raw transport pair.

pub mod authenticated;
pub mod buffered;
pub mod monitored;
