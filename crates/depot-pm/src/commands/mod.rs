//! Package manager commands
//!
//! Implements the project-level commands: install and fetch.

pub mod fetch;
pub mod install;

pub use fetch::fetch_project;
pub use install::{install_packages, install_project, PackageSpecifier};
