//! A generic snapshot save/load mechanism (JSON/MessagePack), format-selected by file extension.
//! Carries no opinion about the `profiles`/`tasks`/`variables` schema (spec §6.3) — that schema is
//! explicitly out of this crate's scope; an embedder can reuse this helper for its own profile
//! store, or for ad hoc diagnostic snapshots.

use std::{fs::File, io::Write, path::Path};

use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

enum Format {
    #[cfg(feature = "json")]
    Json,
    #[cfg(feature = "msgpack")]
    Msgpack,
}

impl Format {
    #[allow(clippy::unnecessary_wraps)]
    fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        match path
            .as_ref()
            .extension()
            .map_or("", |ext| ext.to_str().unwrap())
        {
            #[cfg(feature = "json")]
            "json" => Ok(Self::Json),
            #[cfg(not(feature = "json"))]
            "json" => Err(Error::Unimplemented),
            #[cfg(feature = "msgpack")]
            _ => Ok(Self::Msgpack),
            #[cfg(not(feature = "msgpack"))]
            _ => Err(Error::Unimplemented),
        }
    }
}

/// Loads a snapshot from a file. If "json" extension is specified, it is loaded from JSON format
/// (requires crate 'json' feature), otherwise from MessagePack (requires crate 'msgpack'
/// feature). All errors, including a missing file, must be handled by the caller.
pub fn load<S: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<S> {
    let format = Format::from_path(&path)?;
    let file = File::open(&path)?;
    let data = match format {
        #[cfg(feature = "json")]
        Format::Json => serde_json::from_reader(file).map_err(|e| Error::Snapshot(e.to_string()))?,
        #[cfg(feature = "msgpack")]
        Format::Msgpack => rmp_serde::from_read(file).map_err(|e| Error::Snapshot(e.to_string()))?,
    };
    Ok(data)
}

/// Saves a snapshot to a file. If "json" extension is specified, it is saved in JSON format
/// (requires crate 'json' feature), otherwise in MessagePack (requires crate 'msgpack' feature).
pub fn save<S: Serialize, P: AsRef<Path>>(path: P, state: &S) -> Result<()> {
    let format = Format::from_path(&path)?;
    let mut file = File::create(&path)?;
    let data = match format {
        #[cfg(feature = "json")]
        Format::Json => serde_json::to_vec(state).map_err(|e| Error::Snapshot(e.to_string()))?,
        #[cfg(feature = "msgpack")]
        Format::Msgpack => rmp_serde::to_vec_named(state).map_err(|e| Error::Snapshot(e.to_string()))?,
    };
    file.write_all(&data)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variables::VariableValue;

    #[test]
    fn test_save_load_json_round_trip() {
        let path = std::env::temp_dir().join(format!(
            "macro-core-state-test-{:?}.json",
            std::thread::current().id()
        ));
        let values = vec![
            VariableValue::Number(1.5),
            VariableValue::Bool(true),
            VariableValue::Text("hello".to_string()),
            VariableValue::Point { x: 10, y: 20 },
        ];
        save(&path, &values).unwrap();
        let loaded: Vec<VariableValue> = load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(values, loaded);
    }

    #[test]
    fn test_load_unsupported_extension_errors() {
        let result: Result<Vec<VariableValue>> = load(Path::new("nonexistent.toml"));
        assert!(result.is_err());
    }
}
