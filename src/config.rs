use std::{
    any::type_name,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use clap::Parser;
use serde::{de::DeserializeOwned, Serialize};

/// A setting that can come from the CLI, the environment, or a built-in default,
/// in that priority order. Mirrors the layered config used throughout the service:
/// operators can pin a value at deploy time (env) or override it for one run (CLI)
/// without recompiling.
pub trait ConfigValue: 'static + Send + Sync + Default + Clone + Serialize + DeserializeOwned {
    /// Environment variable name. Defaults to the upper-snake-case type name.
    const ENV_KEY: Option<&'static str> = None;

    fn env_key() -> String {
        Self::ENV_KEY.map(str::to_owned).unwrap_or_else(|| {
            let name = type_name::<Self>().rsplit("::").next().unwrap();
            camel_to_snake_case(name).to_uppercase()
        })
    }
}

fn camel_to_snake_case(input: &str) -> String {
    let mut snake = String::new();
    for (i, ch) in input.char_indices() {
        if i > 0 && ch.is_uppercase() {
            snake.push('_');
        }
        snake.push(ch.to_ascii_lowercase());
    }
    snake
}

#[derive(Debug, Default)]
struct SettingValue<T> {
    default: T,
    cli: Option<T>,
    env: Option<T>,
}

impl<T: ConfigValue> SettingValue<T> {
    fn new(default: T) -> Self {
        let env = std::env::var(T::env_key()).ok().and_then(|raw| {
            match parse_env_value::<T>(&raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(
                        key = T::env_key(),
                        found = raw,
                        "could not parse env value as {}: {e}",
                        type_name::<T>()
                    );
                    None
                }
            }
        });
        Self {
            default,
            cli: None,
            env,
        }
    }

    fn resolved(&self) -> &T {
        self.cli.as_ref().or(self.env.as_ref()).unwrap_or(&self.default)
    }
}

/// Parses a bare scalar (`"3456"`, `"true"`) the way an env var would be written,
/// without requiring quoted JSON strings.
fn parse_env_value<T: DeserializeOwned>(s: &str) -> Result<T, serde_json::Error> {
    if let Ok(v) = serde_json::from_str(s) {
        return Ok(v);
    }
    serde_json::from_value(serde_json::Value::String(s.to_string()))
}

macro_rules! config_value {
    ($name:ident : $ty:ty = $default:expr) => {
        #[derive(Debug, Clone, Serialize, serde::Deserialize)]
        pub struct $name(pub $ty);

        impl Default for $name {
            fn default() -> Self {
                Self($default)
            }
        }

        impl ConfigValue for $name {}
    };
}

config_value!(Port: u16 = 3456);
config_value!(FfmpegBinary: PathBuf = PathBuf::from("ffmpeg"));
config_value!(FfprobeBinary: PathBuf = PathBuf::from("ffprobe"));
config_value!(CanvasRenderer: bool = false);
config_value!(MaxAudioJobs: usize = 6);
config_value!(MaxProbeJobs: usize = 6);
config_value!(MaxEncodeJobs: usize = 3);
config_value!(CanvasCompositorBinary: PathBuf = PathBuf::from("cap-compositor"));

impl AsRef<Path> for CanvasCompositorBinary {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for FfmpegBinary {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for FfprobeBinary {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[derive(Debug)]
pub struct Settings {
    port: SettingValue<Port>,
    ffmpeg_binary: SettingValue<FfmpegBinary>,
    ffprobe_binary: SettingValue<FfprobeBinary>,
    canvas_renderer: SettingValue<CanvasRenderer>,
    max_audio_jobs: SettingValue<MaxAudioJobs>,
    max_probe_jobs: SettingValue<MaxProbeJobs>,
    max_encode_jobs: SettingValue<MaxEncodeJobs>,
    canvas_compositor_binary: SettingValue<CanvasCompositorBinary>,
}

impl Settings {
    fn construct() -> Self {
        Self {
            port: SettingValue::new(Port::default()),
            ffmpeg_binary: SettingValue::new(FfmpegBinary::default()),
            ffprobe_binary: SettingValue::new(FfprobeBinary::default()),
            canvas_renderer: SettingValue::new(CanvasRenderer::default()),
            max_audio_jobs: SettingValue::new(MaxAudioJobs::default()),
            max_probe_jobs: SettingValue::new(MaxProbeJobs::default()),
            max_encode_jobs: SettingValue::new(MaxEncodeJobs::default()),
            canvas_compositor_binary: SettingValue::new(CanvasCompositorBinary::default()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.resolved().0
    }

    pub fn ffmpeg_binary(&self) -> &Path {
        self.ffmpeg_binary.resolved().as_ref()
    }

    pub fn ffprobe_binary(&self) -> &Path {
        self.ffprobe_binary.resolved().as_ref()
    }

    pub fn canvas_renderer(&self) -> bool {
        self.canvas_renderer.resolved().0
    }

    pub fn max_audio_jobs(&self) -> usize {
        self.max_audio_jobs.resolved().0
    }

    pub fn max_probe_jobs(&self) -> usize {
        self.max_probe_jobs.resolved().0
    }

    pub fn max_encode_jobs(&self) -> usize {
        self.max_encode_jobs.resolved().0
    }

    pub fn canvas_compositor_binary(&self) -> &Path {
        self.canvas_compositor_binary.resolved().as_ref()
    }

    fn apply_cli(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.port.cli = Some(Port(port));
        }
        if args.canvas_renderer {
            self.canvas_renderer.cli = Some(CanvasRenderer(true));
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(Settings::construct)
}

/// Command-line overrides. Environment variables are read directly by [`Settings::construct`];
/// CLI flags win over both.
#[derive(Debug, Parser)]
#[command(name = "cap-media-server", about = "Media processing service")]
pub struct Args {
    /// Override the HTTP bind port (env: PORT)
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Force the canvas compositor pipeline on for editor renders (env: CAP_CANVAS_RENDERER)
    #[arg(long)]
    pub canvas_renderer: bool,
}

impl Args {
    pub fn apply(self) {
        let mut settings = Settings::construct();
        settings.apply_cli(&self);
        let _ = SETTINGS.set(settings);
    }
}

/// Watchdog bounds, collected here so call sites don't hardcode them.
pub mod timeouts {
    use super::Duration;

    pub const PROBE: Duration = Duration::from_secs(30);
    pub const THUMBNAIL: Duration = Duration::from_secs(60);
    pub const AUDIO_EXTRACT: Duration = Duration::from_secs(120);
    pub const DOWNLOAD: Duration = Duration::from_secs(600);
    pub const TRANSCODE: Duration = Duration::from_secs(30 * 60);
    pub const STALL_DEFAULT: Duration = Duration::from_secs(180);
    pub const STALL_NEAR_COMPLETE: Duration = Duration::from_secs(60);
    pub const STALL_THRESHOLD_PERCENT: f32 = 98.0;

    pub const JOB_TERMINAL_GRACE: Duration = Duration::from_secs(5 * 60);
    pub const JOB_TTL: Duration = Duration::from_secs(60 * 60);
    pub const JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub const SSE_TICK: Duration = Duration::from_secs(1);

    pub const AUDIO_MAX_BYTES: usize = 100 * 1024 * 1024;
    pub const STDERR_TAIL_BYTES: usize = 64 * 1024;
    pub const PROBE_STDOUT_CAP: usize = 1024 * 1024;
}
