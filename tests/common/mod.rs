//! Shared stub simulation for integration tests.
//!
//! The stub is deliberately order-sensitive: the accumulator mixes every
//! entry's peer id and input with non-commutative arithmetic, so any
//! difference in batch content *or order* shows up in the checksum.

#![allow(dead_code)] // Each integration test binary uses a subset of this module.

use bastion_netcode::{
    Simulation, SimulationError, UpdateInput, UpdateOutput,
};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct StubInput {
    pub value: u32,
}

impl StubInput {
    pub fn new(value: u32) -> Self {
        Self { value }
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct StubServerInput {
    pub seed: u64,
    pub stop: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubSim {
    pub acc: u64,
    pub steps: i64,
}

impl StubSim {
    pub fn new() -> Self {
        Self { acc: 1, steps: 0 }
    }
}

impl Default for StubSim {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation for StubSim {
    type ClientInput = StubInput;
    type ServerInput = StubServerInput;

    fn desired_tick_rate(&self) -> u32 {
        60
    }

    fn update(
        &mut self,
        input: &UpdateInput<StubServerInput, StubInput>,
    ) -> Result<UpdateOutput, SimulationError> {
        self.steps += 1;
        self.acc = self
            .acc
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(input.server_input.seed);
        for entry in &input.inputs {
            self.acc = self
                .acc
                .wrapping_mul(1_442_695_040_888_963_407)
                .wrapping_add(entry.peer.as_i64() as u64)
                .wrapping_add(u64::from(entry.input.value))
                .wrapping_add(u64::from(entry.terminated));
        }
        Ok(UpdateOutput {
            terminated_peers: Vec::new(),
            should_stop: input.server_input.stop,
        })
    }
}
