//! Inference dispatch: routes chat work items to remote inference workers,
//! tracks their lifecycle, and gates workers on compliance.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod reports;
pub mod store;
pub mod workers;
