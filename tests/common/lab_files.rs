//! Shared specification fixtures for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared helpers under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/lab_files.rs"]
//! mod lab_files;
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;

/// A scratch directory holding a specification and a state file location.
pub struct LabFiles {
    _dir: TempDir,
    /// Path of the written specification.
    pub spec: Utf8PathBuf,
    /// Path the simulated backend persists to (not created yet).
    pub state: Utf8PathBuf,
}

impl LabFiles {
    /// Writes `contents` to `lab.yaml` in a fresh temporary directory.
    pub fn with_spec(contents: &str) -> Self {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp path {}", path.display()));
        Dir::open_ambient_dir(&root, ambient_authority())
            .and_then(|handle| handle.write("lab.yaml", contents))
            .unwrap_or_else(|err| panic!("write spec: {err}"));
        Self {
            spec: root.join("lab.yaml"),
            state: root.join("state").join("lab.json"),
            _dir: dir,
        }
    }

    /// Directory root as a UTF-8 path.
    #[allow(dead_code, reason = "not every test binary runs commands from the lab directory")]
    pub fn root(&self) -> &Utf8Path {
        self.spec
            .parent()
            .unwrap_or_else(|| panic!("spec path has a parent"))
    }
}

/// A specification with `instances` members in one template group and a
/// plain group, each selecting two services and one private network.
#[allow(dead_code, reason = "only the lifecycle tests scale the specification")]
pub fn scaled_spec(instances: u32) -> String {
    format!(
        r"
metadata:
  name: scale-lab
services:
  - name: base
    image: debian-12
  - name: web
    base: base
  - name: db
    image: postgres-16
networks:
  - name: lan
  - name: uplink
    shared: true
folders:
  - name: tenants
    services: [base, web, db]
    networks: [lan]
groups:
  - name: blue
    folder: tenants
    services: [web, db]
    networks: [lan, uplink]
    instances: {instances}
  - name: red
    folder: tenants
    services: [web, db]
    networks: [lan]
"
    )
}
