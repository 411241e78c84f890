//! Service instance model.
//!
//! An instance is the declared intent to run one supervised service:
//! which binary, where, with which ports, caps and health policy. The
//! runtime side lives in [`crate::process`].

mod types;

pub use types::{
    FeatureKind, HealthSpec, PortSpec, ProbeKind, Protocol, ResourceCaps, ServiceInstance,
    DEFAULT_PROBE_TIMEOUT, MAX_CHECK_INTERVAL, MIN_CHECK_INTERVAL,
};
