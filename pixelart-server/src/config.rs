use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

#[cfg(feature = "embed_config")]
use rust_embed::RustEmbed;

#[cfg(feature = "embed_config")]
#[derive(RustEmbed)]
#[folder = "../"]
#[include = "pixelart.example.toml"]
struct ConfigAssets;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "pixelart.toml";

pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_PIXEL_SIZE: u32 = 8;
pub const DEFAULT_MIN_PIXEL_SIZE: u32 = 4;
pub const DEFAULT_MAX_PIXEL_SIZE: u32 = 32;
pub const DEFAULT_PIXEL_SIZE_STEP: u32 = 2;

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub uploads: Option<Uploads>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

/// Upload constraints as written in the file; unset fields fall back to defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Uploads {
    pub max_bytes: Option<usize>,
    pub default_pixel_size: Option<u32>,
    pub min_pixel_size: Option<u32>,
    pub max_pixel_size: Option<u32>,
    pub pixel_size_step: Option<u32>,
}

/// Resolved upload constraints.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_bytes: usize,
    pub default_pixel_size: u32,
    pub min_pixel_size: u32,
    pub max_pixel_size: u32,
    pub pixel_size_step: u32,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            default_pixel_size: DEFAULT_PIXEL_SIZE,
            min_pixel_size: DEFAULT_MIN_PIXEL_SIZE,
            max_pixel_size: DEFAULT_MAX_PIXEL_SIZE,
            pixel_size_step: DEFAULT_PIXEL_SIZE_STEP,
        }
    }
}

impl UploadLimits {
    /// Whether `size` lies in range and on the step grid starting at the minimum.
    pub fn accepts_pixel_size(&self, size: u32) -> bool {
        if size == 0 || size < self.min_pixel_size || size > self.max_pixel_size {
            return false;
        }
        let step = self.pixel_size_step.max(1);
        (size - self.min_pixel_size) % step == 0
    }
}

impl Config {
    pub fn upload_limits(&self) -> UploadLimits {
        let d = UploadLimits::default();
        let Some(u) = self.uploads.as_ref() else {
            return d;
        };
        UploadLimits {
            max_bytes: u.max_bytes.unwrap_or(d.max_bytes),
            default_pixel_size: u.default_pixel_size.unwrap_or(d.default_pixel_size),
            min_pixel_size: u.min_pixel_size.unwrap_or(d.min_pixel_size),
            max_pixel_size: u.max_pixel_size.unwrap_or(d.max_pixel_size),
            pixel_size_step: u.pixel_size_step.unwrap_or(d.pixel_size_step),
        }
    }

    pub fn bind_address(&self) -> Option<String> {
        self.server.as_ref().and_then(|s| s.bind_address.clone())
    }
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the embedded example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            #[cfg(feature = "embed_config")]
            {
                if let Some(example_file) = ConfigAssets::get("pixelart.example.toml") {
                    let example_content = std::str::from_utf8(&example_file.data)
                        .with_context(|| "embedded example config is not valid UTF-8")?;

                    fs::write(&path, example_content)
                        .await
                        .with_context(|| format!("writing example config to {}", path.display()))?;

                    // logging is not initialised yet
                    println!("Created default config file: {}", path.display());
                } else {
                    bail!(
                        "config file {} not found and embedded example is not available",
                        path.display()
                    );
                }
            }
            #[cfg(not(feature = "embed_config"))]
            {
                bail!("config file {} not found", path.display());
            }
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&path, &text)
    }

    /// Build a manager from TOML text that will be saved to `path`.
    pub fn parse(path: &Path, text: &str) -> Result<SharedConfig> {
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config {}", path.display()))?;
        // reject documents that do not match the typed schema up front
        toml_edit::de::from_document::<Config>(doc.clone())
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self {
            path: path.to_path_buf(),
            doc,
        })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    /// Update upload constraints. Only provided values are changed.
    pub async fn update_uploads(cfg: &SharedConfig, update: &Uploads) -> Result<UploadLimits> {
        let mut guard = cfg.write().await;
        // edit a copy so a rejected update leaves the live document untouched
        let mut doc = guard.doc.clone();
        let uploads = doc["uploads"].or_insert(Item::Table(toml_edit::Table::new()));
        let Item::Table(tbl) = uploads else {
            bail!("uploads is not a table");
        };
        if let Some(v) = update.max_bytes {
            tbl["max_bytes"] = value(v as i64);
        }
        if let Some(v) = update.default_pixel_size {
            tbl["default_pixel_size"] = value(v as i64);
        }
        if let Some(v) = update.min_pixel_size {
            tbl["min_pixel_size"] = value(v as i64);
        }
        if let Some(v) = update.max_pixel_size {
            tbl["max_pixel_size"] = value(v as i64);
        }
        if let Some(v) = update.pixel_size_step {
            tbl["pixel_size_step"] = value(v as i64);
        }
        let typed: Config = toml_edit::de::from_document(doc.clone())?;
        let limits = typed.upload_limits();
        if limits.min_pixel_size == 0 || limits.min_pixel_size > limits.max_pixel_size {
            bail!(
                "invalid pixel size range {}..={}",
                limits.min_pixel_size,
                limits.max_pixel_size
            );
        }
        if !limits.accepts_pixel_size(limits.default_pixel_size) {
            bail!(
                "default pixel size {} is outside the allowed range",
                limits.default_pixel_size
            );
        }
        guard.doc = doc;
        Ok(limits)
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}
