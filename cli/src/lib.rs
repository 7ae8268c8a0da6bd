//! CNAB Push CLI - push bundles and their images to an OCI registry.

pub mod commands;
