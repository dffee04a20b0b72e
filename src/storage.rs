use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const PERSIST_FILE_NAME: &str = "tanksmonpersist.json";

/// Bytes allowed per tank record, plus a fixed envelope.
const PERSIST_BYTES_PER_TANK: usize = 32;
const PERSIST_ENVELOPE_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persist I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("persist record is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("persist record malformed: {0}")]
    Malformed(serde_json::Error),
    #[error("persist record could not be encoded: {0}")]
    Serialize(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LevelRecord {
    pub level: f32,
}

#[derive(Serialize, Deserialize, Debug)]
struct PersistDoc {
    tanklevels: Vec<LevelRecord>,
}

/// Older records were written as a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDoc {
    Wrapped(PersistDoc),
    Bare(Vec<LevelRecord>),
}

/// Durable last-known tank levels, independent of the site config.
#[derive(Debug, Clone)]
pub struct PersistStore {
    path: PathBuf,
    max_tanks: usize,
}

impl PersistStore {
    pub fn new(root: impl AsRef<Path>, max_tanks: usize) -> Self {
        Self {
            path: root.as_ref().join(PERSIST_FILE_NAME),
            max_tanks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn limit(&self) -> usize {
        PERSIST_ENVELOPE_BYTES + PERSIST_BYTES_PER_TANK * self.max_tanks
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Reads the stored levels. `Ok(None)` means no record exists yet.
    pub fn try_load(&self) -> Result<Option<Vec<f32>>, PersistError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let limit = self.limit();
        if bytes.len() > limit {
            return Err(PersistError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        let doc = serde_json::from_slice::<StoredDoc>(&bytes).map_err(PersistError::Malformed)?;
        let records = match doc {
            StoredDoc::Wrapped(doc) => doc.tanklevels,
            StoredDoc::Bare(records) => records,
        };
        Ok(Some(records.into_iter().map(|r| r.level).collect()))
    }

    /// Like [`try_load`](Self::try_load), degrading any failure to "no record".
    pub fn load(&self) -> Option<Vec<f32>> {
        match self.try_load() {
            Ok(Some(levels)) => {
                info!(path = %self.path.display(), tanks = levels.len(), "loaded persisted levels");
                Some(levels)
            }
            Ok(None) => {
                info!(path = %self.path.display(), "no persisted levels, first boot");
                None
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "ignoring unreadable persist record");
                None
            }
        }
    }

    /// Replaces the stored levels. The previous record stays intact until
    /// the new one is fully on disk.
    pub fn save(&self, levels: &[f32]) -> Result<(), PersistError> {
        // serde_json writes NaN as null, which would not read back
        if let Some(i) = levels.iter().position(|l| !l.is_finite()) {
            return Err(PersistError::Serialize(format!("level {i} is not finite")));
        }
        let doc = PersistDoc {
            tanklevels: levels.iter().map(|&level| LevelRecord { level }).collect(),
        };
        let contents =
            serde_json::to_vec(&doc).map_err(|e| PersistError::Serialize(e.to_string()))?;
        let limit = self.limit();
        if contents.len() > limit {
            return Err(PersistError::TooLarge {
                size: contents.len(),
                limit,
            });
        }

        let tmp = self.temp_path();
        let result = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&contents)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = result {
            error!(error = %e, path = %tmp.display(), "failed to write persist record");
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
