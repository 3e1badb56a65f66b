use std::path::PathBuf;

use log::debug;

use crate::Error;

pub const DEFAULT_PORT: u16 = 3000;
/// Where forwarded files go. Not configurable from the environment.
pub const DEFAULT_SINK_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PUBLIC_DIR: &str = "public";

/// Byte caps applied while receiving an upload. Exceeding either is a 413.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub per_part: u64,
    pub whole_body: u64,
}

impl UploadLimits {
    pub const fn unlimited() -> Self {
        Self {
            per_part: u64::MAX,
            whole_body: u64::MAX,
        }
    }

    pub(crate) fn constraints(&self) -> multer::Constraints {
        multer::Constraints::new().size_limit(
            multer::SizeLimit::new()
                .per_field(self.per_part)
                .whole_stream(self.whole_body),
        )
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            per_part: 10 * 1024 * 1024,
            whole_body: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub sink_url: String,
    pub public_dir: PathBuf,
    pub limits: UploadLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            sink_url: DEFAULT_SINK_URL.to_string(),
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
            limits: UploadLimits::default(),
        }
    }
}

impl Config {
    /// Reads `PORT`, the only setting taken from the environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::with_port(std::env::var("PORT").ok().as_deref())
    }

    fn with_port(port: Option<&str>) -> Result<Self, Error> {
        let port = match port.map(str::trim) {
            None | Some("") => DEFAULT_PORT,
            Some(value) => value
                .parse()
                .map_err(|e| Error::Config(format!("PORT={value:?}: {e}")))?,
        };
        debug!("Using port {}", port);

        Ok(Self {
            port,
            ..Self::default()
        })
    }
}
