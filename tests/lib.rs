//! Shared helpers for gattmesh integration tests
