use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::Local;
use log::warn;

use crate::astro_util::Coordinate;

/// Builds the on-disk layout for session artifacts:
///   {top}/{YYYY-MM-DD}/Acquisitions/seq={n},time={HH-MM-SS},target={ra},{dec}/
///   {top}/{YYYY-MM-DD}/Guidings/seq={n}/
///   {top}/{YYYY-MM-DD}/Focusings/seq={n}/
///   {top}/{YYYY-MM-DD}/Corrections/seq={n}/
/// Each parent folder carries a `.seq` file holding its last used sequence
/// number.
pub struct PathMaker {
    top_folder: PathBuf,
}

impl PathMaker {
    pub fn new(top_folder: &Path) -> Self {
        PathMaker { top_folder: top_folder.to_path_buf() }
    }

    /// Reads, increments, and writes back the folder's sequence counter.
    pub fn make_seq(folder: &Path) -> Result<u32, CanonicalError> {
        fs::create_dir_all(folder).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", folder, e)))?;
        let seq_file = folder.join(".seq");
        let seq = match fs::read_to_string(&seq_file) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(seq) => seq,
                Err(_) => {
                    warn!("Ignoring unparseable {:?}", seq_file);
                    0
                }
            },
            Err(_) => 0,
        } + 1;
        fs::write(&seq_file, format!("{}\n", seq)).map_err(
            |e| failed_precondition_error(
                &format!("Cannot write {:?}: {:?}", seq_file, e)))?;
        Ok(seq)
    }

    pub fn daily_folder(&self) -> Result<PathBuf, CanonicalError> {
        let folder = self.top_folder.join(
            Local::now().format("%Y-%m-%d").to_string());
        fs::create_dir_all(&folder).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", folder, e)))?;
        Ok(folder)
    }

    /// A fresh folder for one acquisition of the given target.
    pub fn acquisition_folder(&self, target: &Coordinate)
                              -> Result<PathBuf, CanonicalError> {
        let parent = self.daily_folder()?.join("Acquisitions");
        let seq = Self::make_seq(&parent)?;
        let folder = parent.join(
            format!("seq={},time={},target={:.4},{:.4}",
                    seq, Local::now().format("%H-%M-%S"),
                    target.ra, target.dec));
        fs::create_dir_all(&folder).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", folder, e)))?;
        Ok(folder)
    }

    /// A fresh folder for one standalone guiding session.
    pub fn guiding_folder(&self) -> Result<PathBuf, CanonicalError> {
        self.sequenced_folder("Guidings")
    }

    /// A fresh folder for one autofocus run.
    pub fn focusing_folder(&self) -> Result<PathBuf, CanonicalError> {
        self.sequenced_folder("Focusings")
    }

    /// A fresh folder for one standalone solve and correct run.
    pub fn correction_folder(&self) -> Result<PathBuf, CanonicalError> {
        self.sequenced_folder("Corrections")
    }

    fn sequenced_folder(&self, kind: &str) -> Result<PathBuf, CanonicalError> {
        let parent = self.daily_folder()?.join(kind);
        let seq = Self::make_seq(&parent)?;
        let folder = parent.join(format!("seq={}", seq));
        fs::create_dir_all(&folder).map_err(|e| failed_precondition_error(
            &format!("Cannot create {:?}: {:?}", folder, e)))?;
        Ok(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_top(test: &str) -> PathBuf {
        let top = std::env::temp_dir().join(
            format!("kestrel_paths_{}_{}", test, std::process::id()));
        let _ = fs::remove_dir_all(&top);
        top
    }

    #[test]
    fn test_make_seq_increments() {
        let top = temp_top("seq");
        assert_eq!(PathMaker::make_seq(&top).unwrap(), 1);
        assert_eq!(PathMaker::make_seq(&top).unwrap(), 2);
        assert_eq!(PathMaker::make_seq(&top).unwrap(), 3);
        fs::remove_dir_all(&top).unwrap();
    }

    #[test]
    fn test_acquisition_folder_layout() {
        let top = temp_top("acq");
        let maker = PathMaker::new(&top);
        let target = Coordinate::new(183.25, -0.5);
        let folder = maker.acquisition_folder(&target).unwrap();
        assert!(folder.is_dir());
        let name = folder.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("seq=1,time="), "name: {}", name);
        assert!(name.ends_with("target=183.2500,-0.5000"), "name: {}", name);
        assert_eq!(folder.parent().unwrap().file_name().unwrap()
                   .to_string_lossy(), "Acquisitions");

        let folder2 = maker.acquisition_folder(&target).unwrap();
        assert!(folder2.file_name().unwrap().to_string_lossy()
                .starts_with("seq=2,"));
        fs::remove_dir_all(&top).unwrap();
    }

    #[test]
    fn test_sequenced_session_folders() {
        let top = temp_top("guide");
        let maker = PathMaker::new(&top);
        let guiding = maker.guiding_folder().unwrap();
        assert!(guiding.ends_with(
            Path::new("Guidings").join("seq=1")));
        let focusing = maker.focusing_folder().unwrap();
        assert!(focusing.ends_with(
            Path::new("Focusings").join("seq=1")));
        let correction = maker.correction_folder().unwrap();
        assert!(correction.ends_with(
            Path::new("Corrections").join("seq=1")));
        fs::remove_dir_all(&top).unwrap();
    }
}  // mod tests.
