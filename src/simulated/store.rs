//! JSON persistence for the simulated backend's inventory.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};

use super::SimulatedError;
use crate::backend::Resource;

/// On-disk shape of the inventory.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(super) struct StateFile {
    pub(super) next_id: u64,
    #[serde(default)]
    pub(super) resources: Vec<Resource>,
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), SimulatedError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| SimulatedError::Store {
        path: path.to_string(),
        message: String::from("state file path is missing a filename"),
    })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> SimulatedError {
    SimulatedError::Store {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Reads the state file, treating a missing file (or directory) as an empty
/// inventory.
pub(super) fn read_state(path: &Utf8Path) -> Result<StateFile, SimulatedError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StateFile::default()),
        Err(err) => return Err(io_error(parent, &err)),
    };
    let contents = match dir.read_to_string(file_name) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StateFile::default()),
        Err(err) => return Err(io_error(path, &err)),
    };
    if contents.trim().is_empty() {
        return Ok(StateFile::default());
    }
    serde_json::from_str(&contents).map_err(|err| SimulatedError::Store {
        path: path.to_string(),
        message: format!("invalid state file: {err}"),
    })
}

/// Writes the state file, creating its directory when needed.
pub(super) fn write_state(path: &Utf8Path, state: &StateFile) -> Result<(), SimulatedError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;

    let rendered = serde_json::to_string_pretty(state).map_err(|err| SimulatedError::Store {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    dir.write(file_name, rendered)
        .map_err(|err| io_error(path, &err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use crate::backend::{PowerState, ResourceKind, ResourcePath};

    fn state_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("nested").join("state.json"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let state = read_state(&state_path(&tmp)).expect("empty state");

        assert_eq!(state.next_id, 0);
        assert!(state.resources.is_empty());
    }

    #[test]
    fn written_state_reads_back() {
        let tmp = TempDir::new().expect("temp dir");
        let path = state_path(&tmp);
        let state = StateFile {
            next_id: 7,
            resources: vec![Resource {
                id: String::from("sim-6"),
                path: ResourcePath::from_segments(["lab", "kali-master"]),
                kind: ResourceKind::Template,
                power: PowerState::Off,
                source: None,
                networks: Vec::new(),
                note: Some(String::from("attacker")),
                vlan: None,
            }],
        };

        write_state(&path, &state).expect("write");
        let read = read_state(&path).expect("read");

        assert_eq!(read.next_id, 7);
        assert_eq!(read.resources, state.resources);
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let tmp = TempDir::new().expect("temp dir");
        let path = state_path(&tmp);
        write_state(&path, &StateFile::default()).expect("write");
        std::fs::write(path.as_std_path(), "{not json").expect("corrupt");

        let err = read_state(&path).expect_err("corrupt state");
        assert!(matches!(err, SimulatedError::Store { .. }));
    }
}
