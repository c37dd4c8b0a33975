//! Persistent user settings: the last signed-in user and cached tokens.

use crate::auth::AuthToken;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SETTINGS_FILE: &str = "settings.json";
const SETTINGS_TEMP: &str = "settings.json.tmp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsData {
    last_user: Option<String>,
    #[serde(default)]
    tokens: BTreeMap<String, String>,
}

/// Settings stored next to the user directories.
///
/// Every update is written out immediately through a temp file and rename.
#[derive(Debug)]
pub struct UserSettings {
    path: PathBuf,
    data: Mutex<SettingsData>,
}

impl UserSettings {
    /// Opens (or starts) the settings file in `dir`.
    pub fn open(dir: &Path) -> SyncResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SETTINGS_FILE);
        let data = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| SyncError::settings(format!("{}: {e}", path.display())))?
        } else {
            SettingsData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// The settings file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The user who last signed in successfully.
    pub fn last_known_user(&self) -> Option<String> {
        self.data.lock().last_user.clone()
    }

    /// The cached token for `username`.
    pub fn token_for(&self, username: &str) -> Option<AuthToken> {
        self.data.lock().tokens.get(username).map(AuthToken::new)
    }

    /// Records a successful sign-in.
    pub fn store_credentials(&self, username: &str, token: &AuthToken) -> SyncResult<()> {
        let mut data = self.data.lock();
        data.last_user = Some(username.to_owned());
        data.tokens
            .insert(username.to_owned(), token.as_str().to_owned());
        self.save(&data)
    }

    /// Forgets the cached token for `username`.
    pub fn clear_token(&self, username: &str) -> SyncResult<()> {
        let mut data = self.data.lock();
        if data.tokens.remove(username).is_none() {
            return Ok(());
        }
        self.save(&data)
    }

    fn save(&self, data: &SettingsData) -> SyncResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SyncError::settings("settings path has no parent"))?;
        let temp_path = dir.join(SETTINGS_TEMP);
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, data)
            .map_err(|e| SyncError::settings(e.to_string()))?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SyncError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
