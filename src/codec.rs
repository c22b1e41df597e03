//! Canonical binary codec for simulation data and wire message bodies.
//!
//! All serialization in the engine funnels through this module so the bincode
//! configuration is defined exactly once. The configuration uses fixed-width
//! integer encoding: identical in-memory content must yield identical bytes on
//! every peer (checksums are compared across machines), and variable-length
//! integer encodings make message sizes depend on values in ways that are
//! easy to get subtly wrong.
//!
//! Float canonicalization is the application's responsibility: if a state
//! contains floats, the [`Simulation`](crate::Simulation) must ensure they are
//! bit-identical across peers before they reach serialization.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::NetcodeError;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes a value into a new byte vector.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, NetcodeError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| NetcodeError::Serialization {
        context: e.to_string(),
    })
}

/// Encodes a value by appending to an existing buffer, returning the number
/// of bytes written. Useful when assembling framed messages incrementally.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> Result<usize, NetcodeError> {
    let start = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start)
        .map_err(|e| NetcodeError::Serialization {
            context: e.to_string(),
        })
}

/// Decodes a value from a byte slice, returning the value and the number of
/// bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), NetcodeError> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| NetcodeError::Serialization {
        context: e.to_string(),
    })
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, NetcodeError> {
    decode(bytes).map(|(value, _)| value)
}

// #########
// # TESTS #
// #########
