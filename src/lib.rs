// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod collections;
pub mod protocols;
pub mod runtime;

pub use crate::{
    protocols::tcp::peer::TcpPeer,
    runtime::{
        fail::Fail,
        memory::{
            Buffer,
            Frame,
        },
        SocketId,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing with an [anyhow] error otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if *left != *right {
            ::anyhow::bail!(
                "ensure_eq failed: `{} == {}`\n  left: `{:?}`\n right: `{:?}`",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing with an [anyhow] error otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if *left == *right {
            ::anyhow::bail!(
                "ensure_neq failed: `{} != {}`\n  left: `{:?}`\n right: `{:?}`",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}
