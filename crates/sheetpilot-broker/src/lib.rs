//! The sheetpilot session/batch broker.
//!
//! This crate is the stateful heart of sheetpilot: it owns live spreadsheet
//! automation handles across many short-lived CLI invocations and enforces
//! the apartment-threading discipline native automation requires.
//!
//! # Architecture
//!
//! ```text
//! daemon request tasks (any thread)
//!     └── SessionRegistry          token → Session
//!           └── BatchHandle        one open workbook, dirty flag
//!                 └── SessionWorker   dedicated OS thread, FIFO mailbox
//!                       └── Box<dyn WorkbookDriver>   the native handle
//! ```
//!
//! Every operation against a workbook is marshalled onto that workbook's
//! dedicated thread and runs in strict submission order. Operations on
//! different sessions run in parallel; operations on one session never do.
//! Mutations are batched in the live workbook until an explicit save.

pub mod bridge;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod registry;
pub mod session;
pub mod worker;

#[cfg(any(test, feature = "fake-driver"))]
pub mod fake;

pub use bridge::{BridgeConfig, BridgeDriver, BridgeDriverFactory};
pub use dispatch::CommandRegistry;
pub use driver::{DriverError, DriverFactory, WorkbookDriver};
pub use error::{BrokerError, Result};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{BatchHandle, Session, SessionInfo};
pub use worker::SessionWorker;
