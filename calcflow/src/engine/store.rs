//! Where stage records, inputs and outputs live.
//!
//! The engine never touches paths directly; it asks a [`MaterialStore`]
//! about sentinel files, archives and records. [`FsStore`] is the
//! calculations-directory layout used in production.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{read_optional_json, CalcConfig, ParameterLayer};
use crate::core::{files, StageKind};
use crate::deck::InputDeck;
use crate::errors::{CalcflowError, ConfigError, Result};
use crate::structure::Structure;

use super::record::StageRecord;

/// Names of compressed output bundles that mark a stage as archived.
const ZIPPED_BUNDLES: [&str; 2] = ["outputs.tar.gz", "outputs.zip"];

/// Prefix of continuation archive directories.
const ARCHIVE_PREFIX: &str = "archive_";

/// A directory belonging to one material.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageLocation {
    /// Material name.
    pub material: String,
    /// Path below the material directory; empty for the material itself.
    pub relative: PathBuf,
}

impl StageLocation {
    /// The material directory.
    #[must_use]
    pub fn material_root(material: &str) -> Self {
        Self {
            material: material.to_string(),
            relative: PathBuf::new(),
        }
    }

    /// The directory of one stage.
    #[must_use]
    pub fn stage(material: &str, kind: StageKind) -> Self {
        Self {
            material: material.to_string(),
            relative: PathBuf::from(kind.dir_name()),
        }
    }

    /// A strained sub-run inside this stage.
    #[must_use]
    pub fn sub_stage(&self, name: &str) -> Self {
        Self {
            material: self.material.clone(),
            relative: self.relative.join(name),
        }
    }

    /// The `n`th continuation archive of this directory.
    #[must_use]
    pub fn archive(&self, n: u32) -> Self {
        self.sub_stage(&format!("{ARCHIVE_PREFIX}{n}"))
    }
}

/// Whether a stage's outputs were bundled away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// Outputs are loose files.
    None,
    /// Outputs were compressed; the stored record is final.
    Zipped,
}

/// Storage seen by the engine.
pub trait MaterialStore: Send + Sync {
    /// Material names, sorted.
    fn materials(&self) -> Result<Vec<String>>;

    /// Returns true if the stop sentinel exists for this material.
    fn is_stopped(&self, material: &str) -> bool;

    /// Places the stop sentinel.
    fn set_stopped(&self, material: &str) -> Result<()>;

    /// Compressed-bundle status of a stage.
    fn archive_status(&self, location: &StageLocation) -> ArchiveStatus;

    /// The persisted record of a stage, if it was ever started.
    fn load_record(&self, location: &StageLocation) -> Result<Option<StageRecord>>;

    /// Persists a stage record.
    fn save_record(&self, location: &StageLocation, record: &StageRecord) -> Result<()>;

    /// Per-material parameter layer.
    fn material_overrides(&self, material: &str) -> std::result::Result<Option<CalcConfig>, ConfigError>;

    /// Per-stage-directory parameter layer.
    fn stage_overrides(
        &self,
        location: &StageLocation,
    ) -> std::result::Result<Option<ParameterLayer>, ConfigError>;

    /// Reads a structure file; `None` if it is missing or empty.
    fn read_structure(&self, location: &StageLocation, file: &str) -> Result<Option<Structure>>;

    /// Reads a text file; `None` if it is missing.
    fn read_text(&self, location: &StageLocation, file: &str) -> Result<Option<String>>;

    /// Path of the job script, as handed to the scheduler.
    fn script_path(&self, location: &StageLocation) -> PathBuf;

    /// Writes an input deck and its job script.
    fn write_inputs(&self, location: &StageLocation, deck: &InputDeck, script: &str) -> Result<()>;

    /// Moves every file except the record and overrides into a new
    /// `archive_<n>` directory and returns `n`.
    fn archive_outputs(&self, location: &StageLocation) -> Result<u32>;

    /// Deletes a stage directory and everything in it.
    fn remove_stage(&self, location: &StageLocation) -> Result<()>;
}

/// A calculations directory: one subdirectory per material.
#[derive(Debug, Clone)]
pub struct FsStore {
    base_dir: PathBuf,
    stop_file: String,
}

impl FsStore {
    /// Store rooted at `base_dir`, using `stop_file` as the sentinel name.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, stop_file: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            stop_file: stop_file.into(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path of a location.
    #[must_use]
    pub fn path(&self, location: &StageLocation) -> PathBuf {
        self.base_dir.join(&location.material).join(&location.relative)
    }
}

fn read_if_exists(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_kept_in_place(name: &str) -> bool {
    name == files::STAGE_RECORD || name == files::OVERRIDES
}

impl MaterialStore for FsStore {
    fn materials(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(files::POSCAR).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn is_stopped(&self, material: &str) -> bool {
        self.base_dir.join(material).join(&self.stop_file).exists()
    }

    fn set_stopped(&self, material: &str) -> Result<()> {
        let dir = self.base_dir.join(material);
        if !dir.is_dir() {
            return Err(ConfigError::new(format!("no material named '{material}'")).into());
        }
        fs::write(dir.join(&self.stop_file), "")?;
        Ok(())
    }

    fn archive_status(&self, location: &StageLocation) -> ArchiveStatus {
        let dir = self.path(location);
        if ZIPPED_BUNDLES.iter().any(|name| dir.join(name).is_file()) {
            ArchiveStatus::Zipped
        } else {
            ArchiveStatus::None
        }
    }

    fn load_record(&self, location: &StageLocation) -> Result<Option<StageRecord>> {
        let path = self.path(location).join(files::STAGE_RECORD);
        match read_if_exists(&path)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save_record(&self, location: &StageLocation, record: &StageRecord) -> Result<()> {
        let dir = self.path(location);
        fs::create_dir_all(&dir)?;
        let text = serde_json::to_string_pretty(record)?;
        // Atomic replace.
        let tmp = dir.join(format!("{}.tmp", files::STAGE_RECORD));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, dir.join(files::STAGE_RECORD))?;
        Ok(())
    }

    fn material_overrides(&self, material: &str) -> std::result::Result<Option<CalcConfig>, ConfigError> {
        let path = self.base_dir.join(material).join(files::OVERRIDES);
        match read_optional_json::<serde_json::Value>(&path)? {
            Some(value) => CalcConfig::from_value(value)
                .map(Some)
                .map_err(|e| e.with_path(&path)),
            None => Ok(None),
        }
    }

    fn stage_overrides(
        &self,
        location: &StageLocation,
    ) -> std::result::Result<Option<ParameterLayer>, ConfigError> {
        read_optional_json(&self.path(location).join(files::OVERRIDES))
    }

    fn read_structure(&self, location: &StageLocation, file: &str) -> Result<Option<Structure>> {
        match read_if_exists(&self.path(location).join(file))? {
            Some(text) if !text.trim().is_empty() => Ok(Some(Structure::from_poscar(&text)?)),
            _ => Ok(None),
        }
    }

    fn read_text(&self, location: &StageLocation, file: &str) -> Result<Option<String>> {
        Ok(read_if_exists(&self.path(location).join(file))?)
    }

    fn script_path(&self, location: &StageLocation) -> PathBuf {
        self.path(location).join(files::JOB_SCRIPT)
    }

    fn write_inputs(&self, location: &StageLocation, deck: &InputDeck, script: &str) -> Result<()> {
        let dir = self.path(location);
        deck.write_to(&dir)?;
        fs::write(dir.join(files::JOB_SCRIPT), script)?;
        Ok(())
    }

    fn archive_outputs(&self, location: &StageLocation) -> Result<u32> {
        let dir = self.path(location);
        let mut last = 0;
        let mut to_move = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                if let Some(n) = name.strip_prefix(ARCHIVE_PREFIX).and_then(|n| n.parse::<u32>().ok()) {
                    last = last.max(n);
                }
            } else if !is_kept_in_place(&name) {
                to_move.push(name);
            }
        }

        let n = last + 1;
        let archive = self.path(&location.archive(n));
        fs::create_dir_all(&archive)?;
        for name in to_move {
            fs::rename(dir.join(&name), archive.join(&name))?;
        }
        Ok(n)
    }

    fn remove_stage(&self, location: &StageLocation) -> Result<()> {
        match fs::remove_dir_all(self.path(location)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CalcflowError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Walltime;
    use crate::engine::record::{RunRecord, StageBody};
    use crate::testing::fixtures;
    use pretty_assertions::assert_eq;

    fn store(dir: &Path) -> FsStore {
        fs::create_dir_all(dir.join("NaCl")).unwrap();
        fs::write(dir.join("NaCl").join(files::POSCAR), fixtures::nacl_structure().to_poscar().unwrap()).unwrap();
        FsStore::new(dir, "STOP")
    }

    #[test]
    fn test_materials_need_a_poscar() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        assert_eq!(store.materials().unwrap(), vec!["NaCl".to_string()]);
    }

    #[test]
    fn test_stop_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(!store.is_stopped("NaCl"));
        store.set_stopped("NaCl").unwrap();
        assert!(store.is_stopped("NaCl"));
        assert!(store.set_stopped("KCl").is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let loc = StageLocation::stage("NaCl", StageKind::Static);
        assert_eq!(store.load_record(&loc).unwrap(), None);

        let record = StageRecord::new(
            StageKind::Static,
            fixtures::stage_parameters(),
            false,
            StageBody::Single(RunRecord::new(Walltime::from_hours(1))),
        );
        store.save_record(&loc, &record).unwrap();
        assert_eq!(store.load_record(&loc).unwrap(), Some(record));
    }

    #[test]
    fn test_archive_moves_outputs_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let loc = StageLocation::stage("NaCl", StageKind::Relax);
        let stage_dir = store.path(&loc);
        fs::create_dir_all(&stage_dir).unwrap();
        for name in [files::STDOUT, files::CONTCAR, files::OVERRIDES, files::STAGE_RECORD] {
            fs::write(stage_dir.join(name), "x").unwrap();
        }

        assert_eq!(store.archive_outputs(&loc).unwrap(), 1);
        assert!(stage_dir.join("archive_1").join(files::STDOUT).is_file());
        assert!(stage_dir.join(files::OVERRIDES).is_file());
        assert!(stage_dir.join(files::STAGE_RECORD).is_file());
        assert!(!stage_dir.join(files::CONTCAR).exists());

        fs::write(stage_dir.join(files::STDOUT), "y").unwrap();
        assert_eq!(store.archive_outputs(&loc).unwrap(), 2);
    }

    #[test]
    fn test_empty_structure_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let root = StageLocation::material_root("NaCl");
        fs::write(store.path(&root).join(files::CONTCAR), "\n").unwrap();
        assert!(store.read_structure(&root, files::CONTCAR).unwrap().is_none());
        assert!(store.read_structure(&root, files::POSCAR).unwrap().is_some());
    }

    #[test]
    fn test_zipped_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let loc = StageLocation::stage("NaCl", StageKind::Static);
        assert_eq!(store.archive_status(&loc), ArchiveStatus::None);
        fs::create_dir_all(store.path(&loc)).unwrap();
        fs::write(store.path(&loc).join("outputs.tar.gz"), "").unwrap();
        assert_eq!(store.archive_status(&loc), ArchiveStatus::Zipped);
    }
}
