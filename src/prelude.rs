pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::mpsc;

pub use std::io::Write;

pub use crate::command::Command;
pub use crate::config::{self, Config};
pub use crate::device::{Device, DeviceInfo, DeviceType};
pub use crate::error::{DecodeError, DeviceInitialisationError};
pub use crate::observer::Observer;
pub use crate::snapshot::{Field, FieldKind, Schema, Snapshot, Value};
pub use crate::{dyness, voltronic};
