//! Two-party secure computation of the maximum of private integer lists,
//! using Yao's garbled circuits with 1-out-of-2 oblivious transfer.

/// Wire messages and the request/reply transport
pub mod channel;
/// Boolean circuit model and max-circuit synthesis
pub mod circuit;
/// Shared constants and default knobs
pub mod constants;
/// Error taxonomy for fatal session failures
pub mod error;
/// Garbled circuit evaluation
pub mod evaluator;
/// Circuit garbling: labels, permutation bits, garbled tables
pub mod garbler;
/// Prime-modulus cyclic group backing the oblivious transfer
pub mod group;
/// Cleartext input files and bit encoding
pub mod input;
/// 1-out-of-2 oblivious transfer subprotocol
pub mod ot;
/// Garbler and evaluator session state machines
pub mod session;
