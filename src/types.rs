//! Core types for fleet-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// A managed device: the remote endpoint being polled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    /// Database identity of the device
    pub id: i64,
    /// Unique short identifier (e.g., "SHELBY")
    pub acronym: String,
    /// Human-readable device name
    pub name: String,
    /// Whether the device participates in scheduled polling
    pub enabled: bool,
    /// Folder-name hint from the originating system; falls back to `acronym`
    pub original_source: Option<String>,
    /// Opaque connection string, expanded into [`DeviceSettings`]
    pub connection_string: String,
}

impl Device {
    /// The folder name used for this device's local files.
    pub fn folder_name(&self) -> &str {
        self.original_source.as_deref().unwrap_or(&self.acronym)
    }
}

/// Parsed form of a device's connection string.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSettings {
    /// Remote host name or address
    pub host: String,
    /// Remote control port
    pub port: u16,
    /// FTP user name
    pub username: String,
    /// FTP password
    pub password: String,
    /// Session-open timeout
    pub connection_timeout: Duration,
    /// Whether the device is reached over a dial-up link
    pub use_dial_up: bool,
    /// Phone-book entry naming the shared modem resource
    pub dial_up_entry_name: String,
    /// Number to dial
    pub dial_up_number: String,
    /// Dial attempt timeout
    pub dial_up_timeout: Duration,
    /// Five-field cron expression driving scheduled runs
    pub schedule: String,
}

impl DeviceSettings {
    /// Parse a `key=value; key=value` connection string.
    ///
    /// Keys are case-insensitive. `host` is required; everything else has a
    /// default. A malformed entry or value is fatal (the §7 table treats a bad
    /// connection string as fatal to runner initialization).
    pub fn parse(connection_string: &str) -> Result<Self> {
        let map = parse_key_value_string(connection_string)?;

        let host = map
            .get("host")
            .cloned()
            .ok_or_else(|| Error::config("host", "connection string has no host"))?;

        Ok(Self {
            host,
            port: parse_field(&map, "port", 21)?,
            username: map.get("username").cloned().unwrap_or_default(),
            password: map.get("password").cloned().unwrap_or_default(),
            connection_timeout: Duration::from_secs(parse_field(&map, "connectiontimeout", 30)?),
            use_dial_up: parse_bool_field(&map, "usedialup", false)?,
            dial_up_entry_name: map.get("dialupentryname").cloned().unwrap_or_default(),
            dial_up_number: map.get("dialupnumber").cloned().unwrap_or_default(),
            dial_up_timeout: Duration::from_secs(parse_field(&map, "dialuptimeout", 90)?),
            schedule: map
                .get("schedule")
                .cloned()
                .unwrap_or_else(|| "* * * * *".to_string()),
        })
    }
}

/// A reusable set of tasks describing what to fetch from a device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Database identity of the profile
    pub id: i64,
    /// Profile name (available as a path-template token)
    pub name: String,
    /// Ordered task list
    pub tasks: Vec<ConnectionProfileTask>,
}

/// One unit of work within a profile: a directory tree to fetch, or an
/// external command to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionProfileTask {
    /// Database identity of the task
    pub id: i64,
    /// Task name, used in progress messages
    pub name: String,
    /// Opaque settings string, expanded into [`TaskSettings`]
    pub settings: String,
}

/// Expanded per-task settings.
///
/// Field semantics follow the task options of the originating fleet system;
/// see each field's doc for the effect on the transfer engine.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSettings {
    /// Comma-separated wildcard patterns selecting remote files (default `*.*`)
    pub file_extensions: String,
    /// Remote directory to fetch from (templatable)
    pub remote_path: String,
    /// Local root directory; empty means the global default local path
    pub local_path: String,
    /// Descend into sub-directories whose name does not begin with `.`
    pub recursive_download: bool,
    /// Remove each remote file after it downloads successfully
    pub delete_remote_files_after_download: bool,
    /// Drop remote files older than the global maximum remote file age
    pub limit_remote_file_download_by_age: bool,
    /// Run the local age-purge pass after the task
    pub delete_old_local_files: bool,
    /// Skip files whose local copy has the same size (and timestamp, when syncing)
    pub skip_download_if_unchanged: bool,
    /// Replace existing local files instead of skipping them
    pub overwrite_existing_local_files: bool,
    /// Move an existing local copy into an `Archive/` sub-folder first
    pub archive_existing_files_before_download: bool,
    /// Set the local file's mtime/atime to the remote timestamp after download
    pub synchronize_timestamps: bool,
    /// Reject remote files larger than this many MB (base-1000)
    pub maximum_file_size: f64,
    /// Cap on files transferred per task; -1 means unlimited
    pub maximum_file_count: i32,
    /// Template for the destination directory below the local path
    pub directory_naming_expression: String,
    /// External command template; when non-empty it replaces the FTP transfer
    pub external_operation: String,
    /// Inactivity timeout for the external operation
    pub external_operation_timeout: Duration,
    /// `domain\user` credentials for UNC local paths (empty = none)
    pub directory_auth_user_name: String,
    /// Password paired with `directory_auth_user_name`
    pub directory_auth_password: String,
    /// Send a notification for each downloaded file
    pub email_on_file_update: bool,
    /// Comma-separated notification recipients
    pub email_recipients: String,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            file_extensions: "*.*".to_string(),
            remote_path: "/".to_string(),
            local_path: String::new(),
            recursive_download: false,
            delete_remote_files_after_download: false,
            limit_remote_file_download_by_age: false,
            delete_old_local_files: false,
            skip_download_if_unchanged: false,
            overwrite_existing_local_files: false,
            archive_existing_files_before_download: false,
            synchronize_timestamps: false,
            maximum_file_size: 1000.0,
            maximum_file_count: -1,
            directory_naming_expression: r"<YYYY><MM>\<DeviceFolderName>".to_string(),
            external_operation: String::new(),
            external_operation_timeout: Duration::from_secs(300),
            directory_auth_user_name: String::new(),
            directory_auth_password: String::new(),
            email_on_file_update: false,
            email_recipients: String::new(),
        }
    }
}

impl TaskSettings {
    /// Parse a task's opaque `key=value; key=value` settings string.
    ///
    /// Unknown keys are ignored so older and newer settings strings remain
    /// interchangeable; malformed entries are fatal to runner initialization.
    pub fn parse(settings: &str) -> Result<Self> {
        let map = parse_key_value_string(settings)?;
        let defaults = Self::default();

        Ok(Self {
            file_extensions: map
                .get("fileextensions")
                .cloned()
                .unwrap_or(defaults.file_extensions),
            remote_path: map.get("remotepath").cloned().unwrap_or(defaults.remote_path),
            local_path: map.get("localpath").cloned().unwrap_or_default(),
            recursive_download: parse_bool_field(&map, "recursivedownload", false)?,
            delete_remote_files_after_download: parse_bool_field(
                &map,
                "deleteremotefilesafterdownload",
                false,
            )?,
            limit_remote_file_download_by_age: parse_bool_field(
                &map,
                "limitremotefiledownloadbyage",
                false,
            )?,
            delete_old_local_files: parse_bool_field(&map, "deleteoldlocalfiles", false)?,
            skip_download_if_unchanged: parse_bool_field(&map, "skipdownloadifunchanged", false)?,
            overwrite_existing_local_files: parse_bool_field(
                &map,
                "overwriteexistinglocalfiles",
                false,
            )?,
            archive_existing_files_before_download: parse_bool_field(
                &map,
                "archiveexistingfilesbeforedownload",
                false,
            )?,
            synchronize_timestamps: parse_bool_field(&map, "synchronizetimestamps", false)?,
            maximum_file_size: parse_field(&map, "maximumfilesize", defaults.maximum_file_size)?,
            maximum_file_count: parse_field(&map, "maximumfilecount", defaults.maximum_file_count)?,
            directory_naming_expression: map
                .get("directorynamingexpression")
                .cloned()
                .unwrap_or(defaults.directory_naming_expression),
            external_operation: map.get("externaloperation").cloned().unwrap_or_default(),
            external_operation_timeout: Duration::from_secs(parse_field(
                &map,
                "externaloperationtimeout",
                300,
            )?),
            directory_auth_user_name: map
                .get("directoryauthusername")
                .cloned()
                .unwrap_or_default(),
            directory_auth_password: map
                .get("directoryauthpassword")
                .cloned()
                .unwrap_or_default(),
            email_on_file_update: parse_bool_field(&map, "emailonfileupdate", false)?,
            email_recipients: map.get("emailrecipients").cloned().unwrap_or_default(),
        })
    }

    /// The comma-split wildcard patterns derived from `file_extensions`.
    pub fn file_specs(&self) -> Vec<String> {
        self.file_extensions
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Whether this task runs an external command instead of an FTP transfer.
    pub fn is_external(&self) -> bool {
        !self.external_operation.trim().is_empty()
    }

    /// Notification recipients, comma-split and trimmed.
    pub fn recipients(&self) -> Vec<String> {
        self.email_recipients
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// One entry of a remote directory listing.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteEntry {
    /// A regular file
    File(RemoteFile),
    /// A sub-directory, by name
    Directory(String),
}

/// A remote file as reported by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteFile {
    /// File name without any directory component
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Remote modification timestamp
    pub modified: DateTime<Utc>,
}

fn parse_key_value_string(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry.split_once('=').ok_or_else(|| Error::Config {
            message: format!("expected key=value, got {entry:?}"),
            key: None,
        })?;
        map.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    Ok(map)
}

fn parse_field<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match map.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::config(key, format!("invalid value {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_bool_field(map: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match map.get(key).map(|s| s.to_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(Error::config(key, format!("invalid boolean {v:?}"))),
    }
}
