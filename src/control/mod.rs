// SPDX-License-Identifier: MIT

pub mod proto;
mod server;
mod wire;

pub use self::server::{
    report_simple, report_station, ControlServer, Reply, NCONNS,
};
pub use self::wire::{CtrlAttr, CtrlBuf, CtrlMessage};
