pub mod build;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod driver;
pub mod failures;
pub mod git;
pub mod lock;
pub mod manifest;
pub mod options;
pub mod revision;
pub mod search;
pub mod session;
pub mod status;
pub mod store;
pub mod subproc;
