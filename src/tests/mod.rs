//! Cross-module tests.
//!
//! `integration` runs real blocking scenarios on the simulation port;
//! `property` checks kernel invariants against simple models.

mod helpers;
mod integration;
