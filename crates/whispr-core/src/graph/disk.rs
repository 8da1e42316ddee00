use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{domain::UserId, errors::Error, graph::record::UserRecord, Result};

/// Characters kept verbatim in record file names.
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'+').remove(b'-').remove(b'_');

const RECORD_EXT: &str = "json";

/// One JSON file per user under `<data_dir>/users`.
#[derive(Clone, Debug)]
pub struct RecordFiles {
    dir: PathBuf,
}

impl RecordFiles {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("users");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &UserId) -> PathBuf {
        let stem = utf8_percent_encode(id.as_str(), FILE_NAME_SET).to_string();
        self.dir.join(format!("{stem}.{RECORD_EXT}"))
    }

    /// Load every record. A file that does not parse is a hard error: silently
    /// dropping it would lose one side of its edges.
    pub fn load_all(&self) -> Result<Vec<UserRecord>> {
        let mut out = Vec::new();
        for ent in fs::read_dir(&self.dir)? {
            let ent = ent?;
            let path = ent.path();
            let name = ent.file_name().to_string_lossy().to_string();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT);
            if name.starts_with('.') || !is_record {
                continue;
            }

            let txt = fs::read_to_string(&path)?;
            let record: UserRecord = serde_json::from_str(&txt).map_err(|e| {
                Error::External(format!("corrupt user record {}: {e}", path.display()))
            })?;

            let stem = name.trim_end_matches(".json");
            let decoded = percent_decode_str(stem).decode_utf8_lossy();
            if decoded != record.id.as_str() {
                tracing::warn!(
                    "user record {} holds id {}; using the id from the file body",
                    path.display(),
                    record.id
                );
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Replace the record on disk: write a temp file, fsync, rename over the
    /// destination, then fsync the directory.
    pub fn write(&self, record: &UserRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let content = serde_json::to_string_pretty(record)?;

        let base = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("record.json")
            .to_string();
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = self
                .dir
                .join(format!(".{base}.tmp-{}-{counter}", std::process::id()));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    let written = tmp
                        .write_all(content.as_bytes())
                        .and_then(|()| tmp.flush())
                        .and_then(|()| tmp.sync_all());
                    if let Err(e) = written {
                        drop(tmp);
                        let _ = fs::remove_file(&candidate);
                        return Err(Error::Io(e));
                    }
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io(e));
        }

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}
