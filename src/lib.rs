//! A library for provisioning, inspecting, and maintaining the flash of
//! Espressif devices over a serial or USB transport
//!
//! The crate is organized in three layers:
//!
//! - the loader protocol: [interface] (transports), [slip] (framing),
//!   [command] (opcodes), [connection] (the command/response engine and
//!   reset sequencing), and [targets] (the chip registry);
//! - flash operations: [flasher] (read/write/erase with compression and
//!   MD5 verification, plus the stub loader) and [partition_table];
//! - content codecs: [fs] (LittleFS, SPIFFS, and FAT images) and [nvs]
//!   (the key/value store, with in-place edits).
//!
//! There is no CLI and no UI in here; shells embed the library and
//! receive progress and session events through the sinks in [event].
//! Logging goes through the `log` facade.
//!
//! ## Example
//!
//! ```no_run
//! use espkit::{
//!     connection::Connection,
//!     flasher::{Flasher, TransportKind},
//!     interface::SerialInterface,
//! };
//!
//! # fn main() -> Result<(), espkit::Error> {
//! let serial = SerialInterface::open("/dev/ttyUSB0", 115_200)?;
//! let connection = Connection::new(Box::new(serial));
//! let mut flasher = Flasher::connect(connection, TransportKind::Native)?;
//!
//! flasher.attach_flash()?;
//! println!("{} with {} flash", flasher.chip(), flasher.flash_size());
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod connection;
pub mod error;
pub mod event;
pub mod flasher;
pub mod fs;
pub mod interface;
pub mod nvs;
pub mod partition_table;
pub mod slip;
pub mod targets;

pub use error::Error;
