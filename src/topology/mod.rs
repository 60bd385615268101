//! Distributed process topology resolution
//!
//! Derives local/global rank and world size from the configuration source.
//! Resolution never fails: absent keys use defaults. The GPU and plugin
//! backend families read different key chains on purpose, because each
//! ecosystem's launchers set different variables; the chains are published
//! here as [`TopologyKeys`] values so the fallback order is visible and
//! testable.
//!
//! Algorithm, in resolution order:
//! 1. `local_rank` = first present key in the family's local-rank chain,
//!    default 0.
//! 2. `global_rank` = `RANK`, default = `local_rank`.
//! 3. `local_world_size` = first present key in the family's
//!    local-world-size chain, default 1.
//! 4. `global_world_size` = `WORLD_SIZE`, default = `local_world_size`.

use serde::Serialize;
use thiserror::Error;

use crate::config::{keys, EnvSource};

/// Which configuration keys feed the per-family topology fields.
#[derive(Debug, Clone)]
pub struct TopologyKeys {
    local_rank: &'static [&'static str],
    local_world_size: &'static [&'static str],
}

impl TopologyKeys {
    /// Chain for dynamically-loaded plugins: crate-specific keys first,
    /// then the launcher's generic keys.
    pub fn plugin() -> Self {
        Self {
            local_rank: &[keys::LOCAL_RANK, keys::GENERIC_LOCAL_RANK],
            local_world_size: &[keys::LOCAL_WORLD_SIZE, keys::GENERIC_LOCAL_WORLD_SIZE],
        }
    }

    /// Chain for the built-in GPU family: the crate-specific local-rank key
    /// only, and the launcher's local world size only.
    pub fn gpu() -> Self {
        Self {
            local_rank: &[keys::LOCAL_RANK],
            local_world_size: &[keys::GENERIC_LOCAL_WORLD_SIZE],
        }
    }
}

/// Invariant violations found when a topology is about to coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// A world size of zero cannot describe a running process
    #[error("local_world_size must be at least 1, got 0")]
    ZeroLocalWorldSize,

    /// The global world cannot be smaller than one machine's share of it
    #[error("global_world_size {global_world_size} is smaller than local_world_size {local_world_size}")]
    WorldSizeInverted {
        local_world_size: usize,
        global_world_size: usize,
    },

    /// Local rank must index into the local world
    #[error("local_rank {local_rank} is out of range for local_world_size {local_world_size}")]
    LocalRankOutOfRange {
        local_rank: usize,
        local_world_size: usize,
    },

    /// Global rank must index into the global world
    #[error("global_rank {global_rank} is out of range for global_world_size {global_world_size}")]
    GlobalRankOutOfRange {
        global_rank: usize,
        global_world_size: usize,
    },
}

/// Resolved process position within a (possibly single-process) job.
///
/// Derived per initialization call, never stored between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessTopology {
    /// Index of this process on its machine
    pub local_rank: usize,
    /// Index of this process in the whole job
    pub global_rank: usize,
    /// Processes on this machine
    pub local_world_size: usize,
    /// Processes in the whole job
    pub global_world_size: usize,
}

impl ProcessTopology {
    /// Resolve from the configuration source using the family's key chains.
    pub fn resolve(env: &EnvSource, family_keys: &TopologyKeys) -> Self {
        let local_rank = env.chain_usize(family_keys.local_rank, 0);
        let global_rank = env.get_usize(keys::GENERIC_GLOBAL_RANK, local_rank);
        let local_world_size = env.chain_usize(family_keys.local_world_size, 1);
        let global_world_size =
            env.get_usize(keys::GENERIC_GLOBAL_WORLD_SIZE, local_world_size);

        Self {
            local_rank,
            global_rank,
            local_world_size,
            global_world_size,
        }
    }

    /// The topology of an uncoordinated single process.
    pub fn single_process() -> Self {
        Self {
            local_rank: 0,
            global_rank: 0,
            local_world_size: 1,
            global_world_size: 1,
        }
    }

    /// Whether this job spans more than one process.
    pub fn is_multiprocess(&self) -> bool {
        self.global_world_size > 1
    }

    /// Check the rank/world relations before standing up a coordinator.
    ///
    /// Resolution itself never fails, so inconsistent launcher variables are
    /// caught here, where they would otherwise wedge a rendezvous.
    pub fn validate_for_coordination(&self) -> Result<(), TopologyError> {
        if self.local_world_size == 0 {
            return Err(TopologyError::ZeroLocalWorldSize);
        }
        if self.global_world_size < self.local_world_size {
            return Err(TopologyError::WorldSizeInverted {
                local_world_size: self.local_world_size,
                global_world_size: self.global_world_size,
            });
        }
        if self.local_rank >= self.local_world_size {
            return Err(TopologyError::LocalRankOutOfRange {
                local_rank: self.local_rank,
                local_world_size: self.local_world_size,
            });
        }
        if self.global_rank >= self.global_world_size {
            return Err(TopologyError::GlobalRankOutOfRange {
                global_rank: self.global_rank,
                global_world_size: self.global_world_size,
            });
        }
        Ok(())
    }
}

impl Default for ProcessTopology {
    fn default() -> Self {
        Self::single_process()
    }
}
