pub(crate) use crate::error::{Result, StoreError};
pub(crate) use crate::hash::ContentHash;
pub(crate) use log::{debug, trace, warn};
pub(crate) use std::path::{Path, PathBuf};
