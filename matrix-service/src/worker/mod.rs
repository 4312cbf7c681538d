// Worker Module
// Worker pool, leases and environment provisioning

pub mod pool;
pub mod provision;

pub use pool::{PoolStats, WorkerHandle, WorkerLease, WorkerPool};
pub use provision::{
    classify_failure, provision_with_retry, HostProvisioner, ProvisionRequest, Provisioner,
    RetryPolicy,
};
