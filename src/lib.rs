//! hafailover - HA failover event engine
//!
//! Drives promote and demote transitions of a dual-controller storage
//! appliance from VRRP role events.
//!
//! - `failover`: event gate, transition runner, promote/demote pipelines
//! - `control`: collaborator traits, process bridge, simulated appliance
//! - `vrrp`: keepalived notify FIFO and observed role table
//! - `observability`: logging, phase scopes, event stream, counters
//! - `cli`: the `hafailover` binary

pub mod cli;
pub mod control;
pub mod failover;
pub mod observability;
pub mod vrrp;
