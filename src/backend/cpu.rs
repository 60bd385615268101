//! CPU backend: in-process host client.

use tracing::debug;

use crate::client::{self, RuntimeClient};
use crate::config::{keys, EnvSource};
use crate::error::AccelResult;

/// Construct the host client.
///
/// Reads the async flag and device count from the configuration source.
/// Never coordinates and never loads a library, so repeated calls are
/// independent of each other.
pub fn initialize(env: &EnvSource) -> AccelResult<RuntimeClient> {
    let asynchronous = env.get_bool(keys::CPU_ASYNC_CLIENT, true);
    let num_devices = env.get_usize(keys::CPU_NUM_DEVICES, 1);
    debug!(asynchronous, num_devices, "initializing CPU backend");
    client::host_client(asynchronous, num_devices)
}
