use std::collections::BTreeMap;
use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::consul::Coordinator;
use crate::error::IngestError;

pub const DEFAULT_INGEST_PREFIX: &str = "downloaders/";
pub const DEFAULT_BACKUP_PREFIX: &str = "databackup/";

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024 * 1024;
pub const MIN_BLOCK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_PART_PROCESSES: usize = 5;
pub const DEFAULT_MAX_CHILDREN: usize = 4;
pub const DEFAULT_DOWNLOAD_COMMAND: &str = "gtdownload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Ingest,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl PgSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub host: String,
    pub port: u16,
    pub access_key: String,
    pub secret_key: String,
    pub secure: bool,
    pub region: String,
}

impl S3Settings {
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub command: String,
    pub credentials: Utf8PathBuf,
    pub max_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartSettings {
    pub processes: usize,
    pub block_size: u64,
}

impl Default for MultipartSettings {
    fn default() -> Self {
        Self {
            processes: DEFAULT_PART_PROCESSES,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub staging_root: Option<Utf8PathBuf>,
    pub pg: PgSettings,
    pub s3: S3Settings,
    pub buckets: BTreeMap<String, String>,
    pub signpost_url: String,
    pub download: Option<DownloadSettings>,
    pub multipart: MultipartSettings,
    pub backup_drivers: BTreeMap<String, S3Settings>,
    pub processes: usize,
}

impl Settings {
    pub fn bucket_for(&self, source: &str) -> Result<&str, IngestError> {
        self.buckets
            .get(source)
            .map(String::as_str)
            .ok_or_else(|| IngestError::MissingConfigKey(format!("s3/buckets/{source}")))
    }

    pub fn staging_root(&self) -> Result<&Utf8PathBuf, IngestError> {
        self.staging_root
            .as_ref()
            .ok_or_else(|| IngestError::MissingConfigKey("path".to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(
        coordinator: &dyn Coordinator,
        prefix: &str,
        role: WorkerRole,
    ) -> Result<Settings, IngestError> {
        let entries = coordinator.list(prefix)?;
        if entries.is_empty() {
            return Err(IngestError::MissingConfigKey(prefix.to_string()));
        }
        Self::resolve(entries, role)
    }

    pub fn resolve(
        entries: Vec<(String, String)>,
        role: WorkerRole,
    ) -> Result<Settings, IngestError> {
        let raw = RawConfig {
            entries: entries.into_iter().collect(),
        };

        let pg = PgSettings {
            host: raw.required("pg/host")?,
            port: raw.parsed_or("pg/port", 5432)?,
            user: raw.required("pg/user")?,
            password: raw.required("pg/pass")?,
            dbname: raw.required("pg/name")?,
        };
        let s3 = raw.s3_settings("s3")?;
        let buckets = raw.children("s3/buckets/");
        let signpost_url = raw.required("signpost_url")?;

        let multipart = MultipartSettings {
            processes: raw.parsed_or("multipart/processes", DEFAULT_PART_PROCESSES)?,
            block_size: raw.parsed_or("multipart/block_size", DEFAULT_BLOCK_SIZE)?,
        };
        if multipart.block_size < MIN_BLOCK_SIZE {
            return Err(IngestError::ConfigValue {
                key: "multipart/block_size".to_string(),
                message: format!("must be at least {MIN_BLOCK_SIZE} bytes"),
            });
        }
        if multipart.processes == 0 {
            return Err(IngestError::ConfigValue {
                key: "multipart/processes".to_string(),
                message: "must be positive".to_string(),
            });
        }

        let (staging_root, download) = match role {
            WorkerRole::Ingest => {
                let download = DownloadSettings {
                    command: raw
                        .optional("download/command")
                        .unwrap_or_else(|| DEFAULT_DOWNLOAD_COMMAND.to_string()),
                    credentials: Utf8PathBuf::from(raw.required("download/credentials")?),
                    max_children: raw.parsed_or("download/max_children", DEFAULT_MAX_CHILDREN)?,
                };
                (Some(Utf8PathBuf::from(raw.required("path")?)), Some(download))
            }
            WorkerRole::Backup => (raw.optional("path").map(Utf8PathBuf::from), None),
        };

        let mut backup_drivers = BTreeMap::new();
        for driver in raw.child_groups("ds3/") {
            let settings = raw.s3_settings(&format!("ds3/{driver}"))?;
            backup_drivers.insert(driver, settings);
        }
        if role == WorkerRole::Backup && backup_drivers.is_empty() {
            return Err(IngestError::MissingConfigKey("ds3/<driver>".to_string()));
        }

        Ok(Settings {
            staging_root,
            pg,
            s3,
            buckets,
            signpost_url,
            download,
            multipart,
            backup_drivers,
            processes: raw.parsed_or("processes", 1)?,
        })
    }
}

struct RawConfig {
    entries: BTreeMap<String, String>,
}

impl RawConfig {
    fn optional(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, IngestError> {
        self.optional(key)
            .ok_or_else(|| IngestError::MissingConfigKey(key.to_string()))
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, IngestError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(value) => value.parse().map_err(|err: T::Err| IngestError::ConfigValue {
                key: key.to_string(),
                message: err.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn s3_settings(&self, base: &str) -> Result<S3Settings, IngestError> {
        Ok(S3Settings {
            host: self.required(&format!("{base}/host"))?,
            port: self.parsed_or(&format!("{base}/port"), 80)?,
            access_key: self.required(&format!("{base}/access_key"))?,
            secret_key: self.required(&format!("{base}/secret_key"))?,
            secure: self.parsed_or(&format!("{base}/secure"), false)?,
            region: self
                .optional(&format!("{base}/region"))
                .unwrap_or_else(|| "us-east-1".to_string()),
        })
    }

    fn children(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(prefix)?;
                (!name.is_empty() && !name.contains('/'))
                    .then(|| (name.to_string(), value.trim().to_string()))
            })
            .collect()
    }

    fn child_groups(&self, prefix: &str) -> Vec<String> {
        let mut groups = self
            .entries
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .filter_map(|rest| rest.split_once('/').map(|(group, _)| group.to_string()))
            .collect::<Vec<_>>();
        groups.dedup();
        groups
    }
}
