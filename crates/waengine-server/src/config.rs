use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line flags. Every flag can also come from the environment and
/// overrides the matching config file key.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Session engine for paired messaging accounts")]
pub struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "WAENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address for the HTTP and WebSocket listener.
    #[arg(long, env = "WAENGINE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Base URL of the backend that receives status reports.
    #[arg(long, env = "WAENGINE_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Directory holding one credential entry per instance.
    #[arg(long, env = "WAENGINE_AUTH_DIR")]
    pub auth_dir: Option<PathBuf>,

    /// Executable implementing the bridge line protocol.
    #[arg(long, env = "WAENGINE_BRIDGE_COMMAND")]
    pub bridge_command: Option<PathBuf>,

    /// Allowed CORS origin. Repeat for several; `*` allows any.
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,

    /// Print pairing codes as QR codes on the terminal.
    #[arg(long, env = "WAENGINE_PRINT_PAIRING_QR")]
    pub print_pairing_qr: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backend_url: String,
    pub auth_dir: PathBuf,
    pub bridge_command: PathBuf,
    pub bridge_args: Vec<String>,
    pub allow_origins: Vec<String>,
    pub startup_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    pub report_timeout_secs: u64,
    /// Limit on a single send round-trip through the bridge.
    pub send_timeout_secs: u64,
    pub print_pairing_qr: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            backend_url: "http://127.0.0.1:8000".to_string(),
            auth_dir: PathBuf::from(".wwebjs_auth"),
            bridge_command: PathBuf::from("waengine-bridge"),
            bridge_args: Vec::new(),
            allow_origins: vec!["*".to_string()],
            startup_timeout_secs: 120,
            destroy_timeout_secs: 15,
            report_timeout_secs: 10,
            send_timeout_secs: 30,
            print_pairing_qr: false,
        }
    }
}

impl ServerConfig {
    /// Load the file named by `--config` (which must exist), else the default
    /// config path if present, else defaults. Flags are applied on top.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Self::config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_args(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(url) = &args.backend_url {
            self.backend_url = url.clone();
        }
        if let Some(dir) = &args.auth_dir {
            self.auth_dir = dir.clone();
        }
        if let Some(command) = &args.bridge_command {
            self.bridge_command = command.clone();
        }
        if !args.allow_origins.is_empty() {
            self.allow_origins = args.allow_origins.clone();
        }
        if args.print_pairing_qr {
            self.print_pairing_qr = true;
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("waengine")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("waengine")
    } else {
        PathBuf::from("/tmp/waengine")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
backend_url = "http://backend:9000"
bridge_args = ["bridge.js"]
startup_timeout_secs = 30
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.backend_url, "http://backend:9000");
        assert_eq!(config.bridge_args, vec!["bridge.js".to_string()]);
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.listen, SocketAddr::from(([0, 0, 0, 0], 5000)));
        assert_eq!(config.auth_dir, PathBuf::from(".wwebjs_auth"));
        assert_eq!(config.allow_origins, vec!["*".to_string()]);
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:6000\"\nauth_dir = \"/var/auth\"\n").unwrap();

        let args = Args {
            config: Some(path),
            listen: Some("127.0.0.1:7000".parse().unwrap()),
            allow_origins: vec!["http://localhost:3000".to_string()],
            print_pairing_qr: true,
            ..Args::default()
        };
        let config = ServerConfig::load(&args).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.auth_dir, PathBuf::from("/var/auth"));
        assert_eq!(config.allow_origins, vec!["http://localhost:3000".to_string()]);
        assert!(config.print_pairing_qr);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            config: Some(dir.path().join("absent.toml")),
            ..Args::default()
        };
        let err = ServerConfig::load(&args).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "startup_timeout_secs = \"soon\"\n").unwrap();
        assert!(ServerConfig::from_file(&path).is_err());
    }
}
