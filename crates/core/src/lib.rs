pub mod adb;
pub mod daemon;
pub mod error;
pub mod event;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use adb::{AdbClient, AdbConfig, AdbCrypto, AdbEvent, AdbEventKind, AdbRegistry, AdbStatus, PushSource};
pub use daemon::{DaemonBootstrap, DaemonConfig};
pub use error::{ErrorKind, MirrorError, Result};
pub use event::EventBus;
pub use server::{RtspListener, ServerConfig};
pub use session::{RtspEvent, RtspEventKind, StreamMessage};
