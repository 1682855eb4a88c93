//! Shared fixtures for importer tests: a fake NBD export, a scripted
//! nbdkit, an HTTP origin and small image builders.

pub mod images;
pub mod nbd;
pub mod origin;
