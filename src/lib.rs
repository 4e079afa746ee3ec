//! Host-side software for the mouse joystick rig, a behavioral assay in which
//! a head-fixed mouse reaches for a motorized joystick and pulls it against a
//! programmable torque to earn a water reward.
//!
//! The trials themselves run on the rig's joystick controller. This crate
//! finds the controller on the serial ports, uploads a schedule of trial
//! blocks to it, starts the assay and then polls it, writing one row per
//! finished trial into a CSV ledger next to a description of the assay.
//!
//! The pieces, bottom up:
//!
//! - [device_client]: the controller RPCs and the values they exchange;
//! - [serial_device] and [dummy_device]: a real controller over a serial
//!   port, and a simulated one;
//! - [rig]: picking the right devices out of the discovered ones;
//! - [schedule]: reading a schedule file and uploading it;
//! - [flatten], [timestamp], [trial_record] and [ledger]: turning trial data
//!   into ledger rows and back;
//! - [assay]: the session that ties it all together;
//! - [gui] and [args]: the terminal monitor and command line of the
//!   `mouse_joystick` binary.

#![warn(missing_docs)]
pub mod args;
pub mod assay;
pub mod device_client;
pub mod dummy_device;
pub mod flatten;
pub mod gui;
pub mod ledger;
pub mod rig;
pub mod schedule;
pub mod serial_device;
pub mod timestamp;
pub mod trial_record;
