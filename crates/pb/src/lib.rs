// @generated - do not modify. Modify build.rs instead.
#![allow(clippy::match_single_binding)]
pub mod status;
pub mod task;
pub mod agent {
    include!(concat!(env!("OUT_DIR"), "/agent.rs"));
}
