//! At-exit serialization of each module's records into its own
//! `cmp.<module>.<pid>.sancov` file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::Configuration;
use crate::record::MAGIC;
use crate::store::TraceStore;

/// Dumps every module with at least one distinct record present in
/// `store` to its own file under `config.output_dir`. Any I/O failure is
/// fatal (spec.md §7: "partial coverage files would mislead consumers").
pub fn dump_all(config: &Configuration, store: &TraceStore) -> Result<()> {
    let pid = nix::unistd::getpid();

    for module_index in 0..store.modules_count() {
        let Some(records) = store.records_for(module_index) else {
            continue;
        };
        if records.is_empty() {
            continue;
        }

        let module_name = store
            .module_name(module_index)
            .expect("module index from modules_count() is always in range");

        let (path, mut file) = open_output_file(config, module_name, pid.as_raw(), module_index)
            .with_context(|| format!("opening coverage output file for module {}", module_name))?;

        write_file(&mut file, store, module_index)
            .with_context(|| format!("writing coverage records for module {}", module_name))?;

        let count = store
            .records_for(module_index)
            .map(|r| r.len())
            .unwrap_or(0);

        eprintln!("CmpSanitizerCoverage: {}: {} PCs written", path.display(), count);
    }

    Ok(())
}

/// Builds `<output_dir>/cmp.<name>.<pid>.sancov`, opening it exclusively.
/// If a module with the same short name already claimed that path (an
/// earlier module index with the same basename), retries with
/// `cmp.<name>.<pid>.<index>.sancov`.
fn open_output_file(
    config: &Configuration,
    module_name: &str,
    pid: i32,
    module_index: usize,
) -> io::Result<(PathBuf, File)> {
    let primary = config
        .output_dir
        .join(format!("cmp.{}.{}.sancov", module_name, pid));

    match OpenOptions::new().write(true).create_new(true).open(&primary) {
        Ok(file) => Ok((primary, file)),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let suffixed = config
                .output_dir
                .join(format!("cmp.{}.{}.{}.sancov", module_name, pid, module_index));
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&suffixed)?;
            Ok((suffixed, file))
        }
        Err(err) => Err(err),
    }
}

#[cfg(target_pointer_width = "32")]
fn write_file(file: &mut File, store: &TraceStore, module_index: usize) -> Result<()> {
    use crate::record::hash32;

    file.write_all(&MAGIC.to_le_bytes())?;
    if let Some(records) = store.records_for(module_index) {
        for &word in records {
            file.write_all(&hash32(word).to_le_bytes())?;
        }
    }
    Ok(())
}

#[cfg(not(target_pointer_width = "32"))]
fn write_file(file: &mut File, store: &TraceStore, module_index: usize) -> Result<()> {
    file.write_all(&MAGIC.to_le_bytes())?;
    if let Some(records) = store.records_for(module_index) {
        for &word in records {
            file.write_all(&word.to_le_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_map::{Module, ModuleMap};
    use rangemap::RangeMap;

    fn two_module_store() -> TraceStore {
        let mut ranges = RangeMap::default();
        ranges.insert(0x1000..0x2000, 0);
        ranges.insert(0x5000..0x6000, 1);
        let module_map = ModuleMap::from_parts(
            vec![
                Module {
                    name: "target".to_string(),
                    base_address: 0x1000,
                    size: 0x1000,
                },
                Module {
                    name: "libfoo".to_string(),
                    base_address: 0x5000,
                    size: 0x1000,
                },
            ],
            ranges,
        );
        TraceStore::new(module_map)
    }

    #[test]
    fn dump_all_writes_one_file_per_module_with_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration {
            output_dir: dir.path().to_path_buf(),
            ..Configuration::default()
        };

        let mut store = two_module_store();
        store.try_save(0x1010, 1, 0);
        store.try_save(0x1011, 2, 0);
        // Module 1 (libfoo) gets no records and should produce no file.

        dump_all(&config, &store).unwrap();

        let pid = nix::unistd::getpid().as_raw();
        let target_path = dir.path().join(format!("cmp.target.{}.sancov", pid));
        let libfoo_path = dir.path().join(format!("cmp.libfoo.{}.sancov", pid));

        assert!(target_path.exists());
        assert!(!libfoo_path.exists());

        let bytes = std::fs::read(&target_path).unwrap();
        assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
        assert_eq!(bytes.len(), 8 + 2 * 8);
    }

    #[test]
    fn filename_collisions_get_suffixed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration {
            output_dir: dir.path().to_path_buf(),
            ..Configuration::default()
        };

        let pid = nix::unistd::getpid().as_raw();
        let primary = dir.path().join(format!("cmp.target.{}.sancov", pid));
        std::fs::write(&primary, b"preexisting").unwrap();

        let (path, _file) = open_output_file(&config, "target", pid, 3).unwrap();
        assert_eq!(
            path,
            dir.path().join(format!("cmp.target.{}.3.sancov", pid))
        );
    }
}
