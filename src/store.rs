use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{CanonicalProduct, Collection};

/// A canonical store file (`{ "pens": [...] }`). Top-level keys other than
/// the collection array are carried through unchanged.
#[derive(Debug, Clone)]
pub struct CatalogDocument {
    pub collection: Collection,
    pub products: Vec<CanonicalProduct>,
    rest: Map<String, Value>,
}

impl CatalogDocument {
    pub fn empty(collection: Collection) -> Self {
        Self {
            collection,
            products: Vec::new(),
            rest: Map::new(),
        }
    }

    pub fn from_bytes(path: &Path, bytes: &[u8], collection: Collection) -> Result<Self, StoreError> {
        let root: Value = serde_json::from_slice(bytes).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let Value::Object(mut rest) = root else {
            return Err(StoreError::Shape {
                path: path.to_path_buf(),
                message: "top level must be an object".into(),
            });
        };

        let items = match rest.remove(collection.key()) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(StoreError::Shape {
                    path: path.to_path_buf(),
                    message: format!("'{}' must be an array", collection.key()),
                })
            }
        };

        let products = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value::<CanonicalProduct>(item).map_err(|e| StoreError::Shape {
                    path: path.to_path_buf(),
                    message: format!("{}[{}]: {}", collection.key(), i, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            collection,
            products,
            rest,
        })
    }

    pub fn load(path: &Path, collection: Collection) -> Result<Self, StoreError> {
        let bytes = fs::read(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(path, &bytes, collection)
    }

    /// Load, treating a missing file as an empty store.
    pub fn load_or_empty(path: &Path, collection: Collection) -> Result<Self, StoreError> {
        if path.exists() {
            Self::load(path, collection)
        } else {
            info!("{} does not exist yet; starting an empty {} store", path.display(), collection);
            Ok(Self::empty(collection))
        }
    }

    pub fn to_value(&self) -> Result<Value, StoreError> {
        let mut root = self.rest.clone();
        root.insert(
            self.collection.key().to_string(),
            serde_json::to_value(&self.products)?,
        );
        Ok(Value::Object(root))
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, &self.to_value()?)
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Pretty-printed JSON written to a temp file in the target directory and
/// renamed over the target. A failure leaves the previous file untouched.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(&bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// `<collection>-<YYYY-MM-DDTHH-MM-SS>.json`, with `-N` appended when taken.
pub fn backup_name(collection: Collection, at: NaiveDateTime, attempt: usize) -> String {
    let stamp = at.format("%Y-%m-%dT%H-%M-%S");
    if attempt == 0 {
        format!("{}-{}.json", collection.key(), stamp)
    } else {
        format!("{}-{}-{}.json", collection.key(), stamp, attempt)
    }
}

/// Copy the store's current bytes into `backup_dir`. Returns `None` when
/// there is no store file yet.
pub fn backup(
    store_path: &Path,
    backup_dir: &Path,
    collection: Collection,
    at: NaiveDateTime,
) -> Result<Option<PathBuf>, StoreError> {
    let bytes = match fs::read(store_path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Backup {
                path: store_path.to_path_buf(),
                source,
            })
        }
    };

    fs::create_dir_all(backup_dir).map_err(|source| StoreError::Backup {
        path: backup_dir.to_path_buf(),
        source,
    })?;

    let mut attempt = 0;
    loop {
        let target = backup_dir.join(backup_name(collection, at, attempt));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                attempt += 1;
                continue;
            }
            Err(source) => return Err(StoreError::Backup { path: target, source }),
        };
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|source| StoreError::Backup {
                path: target.clone(),
                source,
            })?;
        info!("Backed up {} to {}", store_path.display(), target.display());
        return Ok(Some(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    #[test]
    fn other_top_level_keys_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pens.json");
        fs::write(
            &path,
            r#"{ "version": 3, "pens": [ { "id": "a", "sources": ["x"], "series": "Safari" } ] }"#,
        )
        .unwrap();

        let doc = CatalogDocument::load(&path, Collection::Pens).unwrap();
        assert_eq!(doc.products.len(), 1);
        doc.save(&path).unwrap();

        let back: Value = read_json(&path).unwrap();
        assert_eq!(back["version"], json!(3));
        assert_eq!(back["pens"][0]["series"], json!("Safari"));
    }

    #[test]
    fn wrong_shape_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inks.json");
        fs::write(&path, r#"{ "inks": { "id": "a" } }"#).unwrap();
        let err = CatalogDocument::load(&path, Collection::Inks).unwrap_err();
        assert!(matches!(err, StoreError::Shape { .. }));

        fs::write(&path, "{ not json").unwrap();
        let err = CatalogDocument::load(&path, Collection::Inks).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn missing_store_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = CatalogDocument::load_or_empty(&dir.path().join("pens.json"), Collection::Pens).unwrap();
        assert!(doc.products.is_empty());
    }

    #[test]
    fn backup_is_byte_identical_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("pens.json");
        let original = b"{\"pens\":[{\"id\":\"a\"}]}   \n";
        fs::write(&store, original).unwrap();
        let backups = dir.path().join("backups");

        let first = backup(&store, &backups, Collection::Pens, at()).unwrap().unwrap();
        let second = backup(&store, &backups, Collection::Pens, at()).unwrap().unwrap();

        assert_eq!(first.file_name().unwrap(), "pens-2025-01-15T09-30-00.json");
        assert_eq!(second.file_name().unwrap(), "pens-2025-01-15T09-30-00-1.json");
        assert_eq!(fs::read(&first).unwrap(), original);
        assert_eq!(fs::read(&second).unwrap(), original);
    }

    #[test]
    fn no_backup_without_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let made = backup(&dir.path().join("pens.json"), dir.path(), Collection::Pens, at()).unwrap();
        assert!(made.is_none());
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_json_atomic(&path, &json!({ "ok": true })).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("report.json")]);
        assert!(fs::read_to_string(&path).unwrap().ends_with("}\n"));
    }
}
