// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Power sequencing and readiness checks for racks of compute nodes.
//!
//! Nodes are powered through PDU outlets resolved from a connection map, their
//! startup is confirmed by probing until they answer steadily, and whole racks
//! are judged ready from live cluster node state. Out-of-band BMC access rounds
//! out the toolbox.

pub mod batch;
pub mod bmc;
pub mod config;
pub mod node;
pub mod path;
pub mod power;
pub mod rack;
pub mod syscall;
