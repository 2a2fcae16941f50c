//! Controller state persisted across server restarts.
//!
//! The file starts with an 8 byte magic header followed by the
//! bincode-encoded [`ControllerSnapshot`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bincode::Options;
use spalloc_core::{ControllerSnapshot, STATE_VERSION};

use crate::common::error::ServerError;
use crate::common::serialization::bincode_config;

const MAGIC: &[u8; 8] = b"spallocs";

/// `.<config file name>.state.<version>` next to the configuration file.
pub fn state_file_path(config_path: &Path) -> PathBuf {
    let name = config_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "spalloc".to_string());
    let directory = config_path.parent().unwrap_or_else(|| Path::new(""));
    directory.join(format!(".{name}.state.{STATE_VERSION}"))
}

pub fn write_state_file(path: &Path, snapshot: &ControllerSnapshot) -> crate::Result<()> {
    let mut data = MAGIC.to_vec();
    bincode_config().serialize_into(&mut data, snapshot)?;

    // Renamed into place only once fully written
    let mut temporary = OsString::from(path.as_os_str());
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);
    std::fs::write(&temporary, data)?;
    std::fs::rename(&temporary, path)?;
    Ok(())
}

/// Returns `None` when there is no saved state.
pub fn read_state_file(path: &Path) -> crate::Result<Option<ControllerSnapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let Some(body) = data.strip_prefix(MAGIC.as_slice()) else {
        return Err(ServerError::SerializationError(format!(
            "{} is not a state file",
            path.display()
        )));
    };
    let snapshot: ControllerSnapshot = bincode_config().deserialize(body)?;
    if snapshot.version != STATE_VERSION {
        return Err(ServerError::SerializationError(format!(
            "State file version {} does not match {STATE_VERSION}",
            snapshot.version
        )));
    }
    Ok(Some(snapshot))
}
