//! `Policy` aggregate: `draft → active → {suspended ↔ active}`, with
//! `revoked` as the terminal state reachable from anywhere.

pub mod policy;

pub use policy::{
    CreatePolicyInput, Policy, PolicyActivated, PolicyCreated, PolicyEvent, PolicyRevoked,
    PolicyStatus, PolicySuspended,
};
