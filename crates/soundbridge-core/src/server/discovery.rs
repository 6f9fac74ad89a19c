//! Server discovery and startup command construction
//!
//! Provides:
//! - Platform-conditional audio driver and MIDI option enumeration
//! - Device enumeration per driver through the platform audio host
//! - Locating the `patchbayd` executable on disk
//! - Building a validated startup command line from [`CommandLineOptions`]
//! - Persisting that command line to the user's `.patchbayrc`
//!
//! Enumeration never fails: no hardware means an empty list, not an error.
//! Only `build_command_line` and `write_config_file` can refuse.

use std::path::{Path, PathBuf};

use cpal::traits::{DeviceTrait, HostTrait};
use thiserror::Error;

/// Pretty driver names shown to users
pub const ALSA_DRIVER: &str = "ALSA";
pub const OSS_DRIVER: &str = "OSS";
pub const COREAUDIO_DRIVER: &str = "CoreAudio";
pub const WASAPI_DRIVER: &str = "WASAPI";
pub const ASIO_DRIVER: &str = "ASIO";
pub const DUMMY_DRIVER: &str = "Dummy";

/// Placeholder device for drivers without per-device selection
pub const DEFAULT_DEVICE: &str = "Default";

const NONE_LABEL: &str = "None";

/// Errors from startup command construction
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("server executable path is not set")]
    MissingServerPath,

    #[error("unknown audio driver: {0}")]
    UnknownDriver(String),

    #[error("driver {0} requires a device but none is configured")]
    MissingDevice(String),

    #[error("unknown MIDI option: {0}")]
    UnknownMidiOption(String),

    #[error("unknown dither mode: {0}")]
    UnknownDitherMode(String),
}

/// Sample format requested from the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SampleFormat {
    #[default]
    Float32,
    Int16,
}

/// Every tunable server startup parameter.
///
/// Built fresh per start attempt and never mutated after being rendered to
/// a command-line string. Defaults mirror the server's own defaults.
#[derive(Debug, Clone)]
pub struct CommandLineOptions {
    pub server_path: PathBuf,
    /// Client watchdog timeout in ms (0 selects the server default)
    pub timeout_ms: u32,
    pub no_memory_lock: bool,
    pub ports_max: u32,
    pub realtime: bool,
    /// Scheduling priority; 0 leaves the server's choice in place
    pub priority: u32,
    pub verbose: bool,
    /// Shut the server down when its last client leaves
    pub temporary: bool,
    pub driver: String,
    pub input_device: String,
    pub output_device: String,
    pub num_periods: u32,
    pub period_size: u32,
    pub sample_rate: u32,
    pub input_latency: u32,
    pub output_latency: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub dither_mode: String,
    pub sample_format: SampleFormat,
    pub soft_mode: bool,
    /// Command-line token of the MIDI driver; set via [`apply_midi_option`]
    pub midi_driver: String,
}

impl Default for CommandLineOptions {
    fn default() -> Self {
        Self {
            server_path: PathBuf::new(),
            timeout_ms: 0,
            no_memory_lock: false,
            ports_max: 128,
            realtime: true,
            priority: 0,
            verbose: false,
            temporary: true,
            driver: String::new(),
            input_device: String::new(),
            output_device: String::new(),
            num_periods: 2,
            period_size: 1024,
            sample_rate: 48000,
            input_latency: 0,
            output_latency: 0,
            input_channels: 0,
            output_channels: 0,
            dither_mode: String::new(),
            sample_format: SampleFormat::Float32,
            soft_mode: false,
            midi_driver: String::new(),
        }
    }
}

/// Audio drivers available on this platform, most likely first.
///
/// Never empty on a supported platform.
pub fn audio_driver_names() -> Vec<String> {
    let mut names = Vec::new();

    #[cfg(target_os = "linux")]
    {
        names.push(ALSA_DRIVER.to_string());
        names.push(OSS_DRIVER.to_string());
    }

    #[cfg(target_os = "macos")]
    {
        names.push(COREAUDIO_DRIVER.to_string());
    }

    #[cfg(target_os = "windows")]
    {
        names.push(WASAPI_DRIVER.to_string());
        names.push(ASIO_DRIVER.to_string());
    }

    names.push(DUMMY_DRIVER.to_string());
    names
}

/// Most likely driver for this platform
pub fn default_audio_driver() -> String {
    audio_driver_names().remove(0)
}

fn driver_command_line_name(driver: &str) -> Option<&'static str> {
    match driver {
        ALSA_DRIVER => Some("alsa"),
        OSS_DRIVER => Some("oss"),
        COREAUDIO_DRIVER => Some("coreaudio"),
        WASAPI_DRIVER => Some("wasapi"),
        ASIO_DRIVER => Some("asio"),
        DUMMY_DRIVER => Some("dummy"),
        _ => None,
    }
}

/// True if the driver can capture and play back on two distinct devices
pub fn driver_supports_two_devices(driver: &str) -> bool {
    driver == ALSA_DRIVER || driver == OSS_DRIVER
}

/// True if the driver honors systemic latency flags
pub fn driver_supports_latency_adjustment(driver: &str) -> bool {
    matches!(
        driver,
        ALSA_DRIVER | COREAUDIO_DRIVER | WASAPI_DRIVER | ASIO_DRIVER
    )
}

/// True if the driver accepts a period count
pub fn driver_supports_period_count(driver: &str) -> bool {
    driver == ALSA_DRIVER || driver == OSS_DRIVER
}

/// Device names currently visible for `driver`.
///
/// Empty when the driver has no host on this platform or no hardware is
/// present; never an error.
pub fn devices_for_driver(driver: &str) -> Vec<String> {
    if driver == DUMMY_DRIVER {
        return vec![DEFAULT_DEVICE.to_string()];
    }

    let Some(host) = host_for_driver(driver) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(devices) = host.devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    names
}

#[cfg(target_os = "linux")]
fn host_for_driver(driver: &str) -> Option<cpal::Host> {
    if driver == ALSA_DRIVER {
        return cpal::host_from_id(cpal::HostId::Alsa).ok();
    }
    None
}

#[cfg(target_os = "macos")]
fn host_for_driver(driver: &str) -> Option<cpal::Host> {
    if driver == COREAUDIO_DRIVER {
        return Some(cpal::default_host());
    }
    None
}

#[cfg(target_os = "windows")]
fn host_for_driver(driver: &str) -> Option<cpal::Host> {
    match driver {
        WASAPI_DRIVER => cpal::host_from_id(cpal::HostId::Wasapi).ok(),
        ASIO_DRIVER => cpal::host_from_id(cpal::HostId::Asio).ok(),
        _ => None,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn host_for_driver(_driver: &str) -> Option<cpal::Host> {
    None
}

/// Human-readable sample rate choices for configuration UIs
pub fn sample_rate_labels() -> Vec<String> {
    [8000u32, 22050, 44100, 48000, 88200, 96000, 192000]
        .iter()
        .map(|r| format!("{}Hz", r))
        .collect()
}

/// Period size choices for configuration UIs
pub fn period_size_labels() -> Vec<String> {
    [32u32, 64, 128, 256, 512, 1024, 2048, 4096, 8192]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

/// Round-trip latency label for a rate/periods/period-size combination
pub fn latency_label(sample_rate: u32, periods: u32, period_size: u32) -> String {
    let msec = (periods as f64 * period_size as f64) / (sample_rate as f64 / 1000.0);
    format!("{:.1}msec", msec)
}

/// Dither modes offered for a driver; the first entry is always "None"
pub fn dither_modes_for_driver(driver: &str) -> Vec<String> {
    let mut modes = vec![NONE_LABEL.to_string()];
    if driver == ALSA_DRIVER {
        modes.push("Triangular".to_string());
        modes.push("Rectangular".to_string());
        modes.push("Shaped".to_string());
    }
    modes
}

fn dither_command_line_name(mode: &str) -> Option<&'static str> {
    match mode {
        "Triangular" => Some("triangular"),
        "Rectangular" => Some("rectangular"),
        "Shaped" => Some("shaped"),
        _ => None,
    }
}

/// MIDI system choices for this platform, "None" last
pub fn midi_option_names() -> Vec<String> {
    let mut names: Vec<String> = Vec::new();

    #[cfg(target_os = "linux")]
    {
        names.push("ALSA raw devices".to_string());
        names.push("ALSA sequencer".to_string());
    }

    #[cfg(target_os = "macos")]
    {
        names.push("CoreMIDI".to_string());
    }

    #[cfg(target_os = "windows")]
    {
        names.push("System MIDI (MME)".to_string());
    }

    names.push(NONE_LABEL.to_string());
    names
}

/// Map a pretty MIDI option onto `options.midi_driver`.
///
/// "None" or an empty choice clears the driver.
pub fn apply_midi_option(
    options: &mut CommandLineOptions,
    choice: &str,
) -> Result<(), CommandLineError> {
    let token = match choice {
        "" | NONE_LABEL => "",
        "ALSA raw devices" => "alsarawmidi",
        "ALSA sequencer" => "alsaseq",
        "CoreMIDI" => "coremidi",
        "System MIDI (MME)" => "winmme",
        other => return Err(CommandLineError::UnknownMidiOption(other.to_string())),
    };
    options.midi_driver = token.to_string();
    Ok(())
}

/// Executable names the server installs under
pub fn server_executable_names() -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        vec!["patchbayd.exe".to_string()]
    }

    #[cfg(not(target_os = "windows"))]
    {
        vec!["patchbayd".to_string()]
    }
}

/// Directories to search for the server executable
pub fn server_dir_paths() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    // A bundled server next to our own executable wins over the system one
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
        }
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path_var));
    }

    #[cfg(unix)]
    for fallback in ["/usr/bin", "/bin", "/usr/local/bin", "/opt/local/bin"] {
        let p = PathBuf::from(fallback);
        if !dirs.contains(&p) {
            dirs.push(p);
        }
    }

    dirs
}

/// Existing executables from the cartesian product of `dirs` and `names`
pub fn resolve_server_paths(dirs: &[PathBuf], names: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() && !found.contains(&candidate) {
                found.push(candidate);
            }
        }
    }
    found
}

/// Best server executable on this machine, if any
pub fn default_server_path() -> Option<PathBuf> {
    resolve_server_paths(&server_dir_paths(), &server_executable_names())
        .into_iter()
        .next()
}

fn quote(token: &str) -> String {
    if token.contains(' ') {
        format!("\"{}\"", token)
    } else {
        token.to_string()
    }
}

/// Render `options` into the server's startup command line.
///
/// Deterministic: the same options always produce byte-identical output.
/// Fails closed when the server path is unset, the driver is unknown, or a
/// hardware driver has no device configured.
pub fn build_command_line(options: &CommandLineOptions) -> Result<String, CommandLineError> {
    if options.server_path.as_os_str().is_empty() {
        return Err(CommandLineError::MissingServerPath);
    }

    let driver_token = driver_command_line_name(&options.driver)
        .ok_or_else(|| CommandLineError::UnknownDriver(options.driver.clone()))?;

    let mut args: Vec<String> = Vec::new();
    args.push(options.server_path.to_string_lossy().into_owned());

    // Global server flags, fixed order
    let timeout = if options.timeout_ms == 0 {
        200
    } else {
        options.timeout_ms
    };
    args.push("-t".into());
    args.push(timeout.to_string());

    if options.no_memory_lock {
        args.push("-m".into());
    }

    args.push("-p".into());
    args.push(options.ports_max.to_string());

    if options.realtime {
        args.push("-R".into());
        if options.priority != 0 {
            args.push("-P".into());
            args.push(options.priority.to_string());
        }
    } else {
        args.push("-r".into());
    }

    if options.verbose {
        args.push("-v".into());
    }

    if options.temporary {
        args.push("-T".into());
    }

    // Driver subcommand
    args.push("-d".into());
    args.push(driver_token.into());

    if options.driver == DUMMY_DRIVER {
        if options.input_channels != 0 {
            args.push("-C".into());
            args.push(options.input_channels.to_string());
        }
        if options.output_channels != 0 {
            args.push("-P".into());
            args.push(options.output_channels.to_string());
        }
    } else {
        let input_device = options.input_device.clone();
        let mut output_device = options.output_device.clone();

        if input_device.is_empty() && output_device.is_empty() {
            return Err(CommandLineError::MissingDevice(options.driver.clone()));
        }

        if input_device.is_empty() {
            // playback only
            args.push("-P".into());
            args.push(quote(&output_device));
        } else if output_device.is_empty() {
            // capture only
            args.push("-C".into());
            args.push(quote(&input_device));
        } else if input_device != output_device {
            if driver_supports_two_devices(&options.driver) {
                args.push("-C".into());
                args.push(quote(&input_device));
                args.push("-P".into());
                args.push(quote(&output_device));
            } else {
                // The driver only takes one device. Use the capture device
                // for both sides rather than refusing to start.
                tracing::debug!(
                    driver = %options.driver,
                    input = %input_device,
                    output = %output_device,
                    "driver cannot split devices, using the input device for both"
                );
                output_device = input_device.clone();
            }
        }

        if options.input_channels != 0 {
            args.push("-i".into());
            args.push(options.input_channels.to_string());
        }
        if options.output_channels != 0 {
            args.push("-o".into());
            args.push(options.output_channels.to_string());
        }

        if driver_supports_period_count(&options.driver) {
            args.push("-n".into());
            args.push(options.num_periods.to_string());
        }

        if input_device == output_device && input_device != DEFAULT_DEVICE {
            args.push("-d".into());
            args.push(quote(&input_device));
        }
    }

    args.push("-r".into());
    args.push(options.sample_rate.to_string());

    args.push("-p".into());
    args.push(options.period_size.to_string());

    if driver_supports_latency_adjustment(&options.driver) {
        if options.input_latency != 0 {
            args.push("-I".into());
            args.push(options.input_latency.to_string());
        }
        if options.output_latency != 0 {
            args.push("-O".into());
            args.push(options.output_latency.to_string());
        }
    }

    if options.driver == ALSA_DRIVER {
        if !options.dither_mode.is_empty() && options.dither_mode != NONE_LABEL {
            let token = dither_command_line_name(&options.dither_mode).ok_or_else(|| {
                CommandLineError::UnknownDitherMode(options.dither_mode.clone())
            })?;
            args.push("-z".into());
            args.push(token.into());
        }
        if options.sample_format == SampleFormat::Int16 {
            args.push("-S".into());
        }
        if options.soft_mode {
            args.push("-s".into());
        }
    }

    if !options.midi_driver.is_empty() {
        args.push("-X".into());
        args.push(options.midi_driver.clone());
    }

    Ok(args.join(" "))
}

/// File name of the persisted startup command
pub fn config_file_name() -> &'static str {
    ".patchbayrc"
}

/// Per-user path of the persisted startup command
pub fn config_file_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(config_file_name())
}

/// Overwrite the config file with `command_line`.
///
/// The file handle is scoped inside `fs::write`: it is closed even on a
/// short write.
pub fn write_config_file(path: &Path, command_line: &str) -> std::io::Result<()> {
    if let Err(e) = std::fs::write(path, command_line) {
        tracing::error!(path = %path.display(), error = %e, "cannot store server startup command");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dummy_options() -> CommandLineOptions {
        CommandLineOptions {
            server_path: PathBuf::from("/usr/bin/patchbayd"),
            driver: DUMMY_DRIVER.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn drivers_never_empty() {
        let drivers = audio_driver_names();
        assert!(!drivers.is_empty());
        assert!(drivers.contains(&DUMMY_DRIVER.to_string()));
        assert_eq!(default_audio_driver(), drivers[0]);
    }

    #[test]
    fn dummy_driver_has_default_device() {
        assert_eq!(devices_for_driver(DUMMY_DRIVER), vec![DEFAULT_DEVICE]);
    }

    #[test]
    fn unknown_driver_has_no_devices() {
        assert!(devices_for_driver("NoSuchApi").is_empty());
    }

    #[test]
    fn command_line_fails_without_server_path() {
        let mut options = dummy_options();
        options.server_path = PathBuf::new();
        assert_eq!(
            build_command_line(&options),
            Err(CommandLineError::MissingServerPath)
        );
    }

    #[test]
    fn command_line_fails_without_device() {
        let mut options = dummy_options();
        options.driver = default_audio_driver();
        if options.driver != DUMMY_DRIVER {
            assert_eq!(
                build_command_line(&options),
                Err(CommandLineError::MissingDevice(options.driver.clone()))
            );
        }
    }

    #[test]
    fn command_line_is_deterministic() {
        let options = dummy_options();
        let a = build_command_line(&options).unwrap();
        let b = build_command_line(&options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn command_line_quotes_spaces() {
        let mut options = dummy_options();
        options.driver = ALSA_DRIVER.to_string();
        options.input_device = "USB Audio Device".to_string();
        options.output_device = "USB Audio Device".to_string();

        let line = build_command_line(&options).unwrap();
        assert!(line.contains("\"USB Audio Device\""));
    }

    #[test]
    fn command_line_splits_devices_when_supported() {
        let mut options = dummy_options();
        options.driver = ALSA_DRIVER.to_string();
        options.input_device = "hw:0".to_string();
        options.output_device = "hw:1".to_string();

        let line = build_command_line(&options).unwrap();
        assert!(line.contains("-C hw:0"));
        assert!(line.contains("-P hw:1"));
    }

    #[test]
    fn split_devices_fold_to_input_when_unsupported() {
        let mut options = dummy_options();
        options.driver = COREAUDIO_DRIVER.to_string();
        options.input_device = "Duplex A".to_string();
        options.output_device = "Duplex B".to_string();

        let line = build_command_line(&options).unwrap();
        assert!(line.contains("-d \"Duplex A\""));
        assert!(!line.contains("Duplex B"));
    }

    #[test]
    fn realtime_flag_and_priority() {
        let mut options = dummy_options();
        options.priority = 70;
        let line = build_command_line(&options).unwrap();
        assert!(line.contains("-R -P 70"));

        options.realtime = false;
        let line = build_command_line(&options).unwrap();
        assert!(!line.contains("-R"));
    }

    #[test]
    fn midi_option_mapping() {
        let mut options = dummy_options();
        assert!(apply_midi_option(&mut options, "None").is_ok());
        assert!(options.midi_driver.is_empty());

        assert!(matches!(
            apply_midi_option(&mut options, "Bongo MIDI"),
            Err(CommandLineError::UnknownMidiOption(_))
        ));
    }

    #[test]
    fn dither_modes_start_with_none() {
        for driver in audio_driver_names() {
            let modes = dither_modes_for_driver(&driver);
            assert_eq!(modes[0], "None");
        }
        assert_eq!(dither_modes_for_driver(ALSA_DRIVER).len(), 4);
    }

    #[test]
    fn latency_label_arithmetic() {
        // 2 periods of 1024 frames at 48kHz is 42.7ms round trip
        let label = latency_label(48000, 2, 1024);
        assert_eq!(label, "42.7msec");

        let msec: f64 = label.trim_end_matches("msec").parse().unwrap();
        assert_relative_eq!(msec, 42.7, epsilon = 0.05);
    }

    #[test]
    fn write_config_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(config_file_name());

        write_config_file(&path, "patchbayd -d dummy").unwrap();
        write_config_file(&path, "patchbayd -d alsa").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "patchbayd -d alsa");
    }

    #[test]
    fn resolve_paths_finds_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("patchbayd");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        let found = resolve_server_paths(
            &[dir.path().to_path_buf(), PathBuf::from("/nonexistent")],
            &["patchbayd".to_string(), "other".to_string()],
        );
        assert_eq!(found, vec![exe]);
    }
}
