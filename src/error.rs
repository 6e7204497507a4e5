use std::io;

use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Mirrors the source's negative-`errno` return convention: each variant
/// corresponds to one of the `errno`-shaped codes documented in the original
/// `coremodel.h`, but carries whatever structure Rust can give for free.
#[derive(Error, Debug)]
pub enum CoremodelError {
    #[error("no target given and COREMODEL_VM is not set")]
    BadTarget,

    #[error("transport is down: {0}")]
    TransportDown(#[from] io::Error),

    #[error("a query (list or attach) is already outstanding")]
    QueryBusy,

    #[error("attach rejected by VM")]
    AttachRejected,

    #[error("allocation failed while enqueuing outbound packet")]
    AllocFailed,

    #[error("not connected to a VM")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CoremodelError>;
