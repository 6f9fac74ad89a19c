//! E2E tests for startup command construction and persistence
//!
//! Verifies the fail-closed and deterministic properties of the command
//! line builder and the overwrite semantics of the config file.

use std::path::PathBuf;

use soundbridge::server::discovery::{
    self, build_command_line, write_config_file, CommandLineError, CommandLineOptions,
};

fn valid_options() -> CommandLineOptions {
    CommandLineOptions {
        server_path: PathBuf::from("/usr/bin/patchbayd"),
        driver: discovery::DUMMY_DRIVER.to_string(),
        ..Default::default()
    }
}

/// Same options must always produce byte-identical output
#[test]
fn command_line_is_idempotent() {
    let options = valid_options();

    let first = build_command_line(&options).expect("valid options must build");
    let second = build_command_line(&options).expect("valid options must build");

    assert_eq!(first, second);
}

/// Empty server path fails; filling in path, driver and device flips the
/// same options to success
#[test]
fn command_line_fails_closed_then_succeeds() {
    let mut options = CommandLineOptions::default();
    assert_eq!(
        build_command_line(&options),
        Err(CommandLineError::MissingServerPath)
    );

    options.server_path = PathBuf::from("/usr/bin/patchbayd");
    // Driver is still empty
    assert!(matches!(
        build_command_line(&options),
        Err(CommandLineError::UnknownDriver(_))
    ));

    options.driver = discovery::ALSA_DRIVER.to_string();
    assert_eq!(
        build_command_line(&options),
        Err(CommandLineError::MissingDevice(
            discovery::ALSA_DRIVER.to_string()
        ))
    );

    options.input_device = "hw:0".to_string();
    options.output_device = "hw:0".to_string();
    let line = build_command_line(&options).expect("complete options must build");
    assert!(line.starts_with("/usr/bin/patchbayd"));
    assert!(line.contains("-d alsa"));
    assert!(line.contains("-d hw:0"));
}

/// Global server flags come before the driver subcommand
#[test]
fn global_flags_precede_driver_section() {
    let line = build_command_line(&valid_options()).unwrap();

    let global = line.find("-T").expect("temporary flag present");
    let driver = line.find("-d dummy").expect("driver subcommand present");
    assert!(global < driver);

    // Defaults: watchdog timeout, port limit, realtime
    assert!(line.contains("-t 200"));
    assert!(line.contains("-p 128"));
    assert!(line.contains("-R"));
}

/// Rate and period size are always rendered from the options
#[test]
fn rate_and_period_always_present() {
    let mut options = valid_options();
    options.sample_rate = 96000;
    options.period_size = 256;

    let line = build_command_line(&options).unwrap();
    assert!(line.contains("-r 96000"));
    assert!(line.contains("-p 256"));
}

/// Systemic latencies only appear for drivers that support adjustment
#[test]
fn latency_flags_respect_driver_capability() {
    let mut options = valid_options();
    options.driver = discovery::ALSA_DRIVER.to_string();
    options.input_device = "hw:0".to_string();
    options.output_device = "hw:0".to_string();
    options.input_latency = 64;
    options.output_latency = 128;

    let line = build_command_line(&options).unwrap();
    assert!(line.contains("-I 64"));
    assert!(line.contains("-O 128"));

    let mut dummy = valid_options();
    dummy.input_latency = 64;
    let line = build_command_line(&dummy).unwrap();
    assert!(!line.contains("-I"));
}

/// Config file is overwritten, never appended
#[test]
fn config_file_holds_exactly_one_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(discovery::config_file_name());

    let first = build_command_line(&valid_options()).unwrap();
    write_config_file(&path, &first).unwrap();

    let mut changed = valid_options();
    changed.sample_rate = 44100;
    let second = build_command_line(&changed).unwrap();
    write_config_file(&path, &second).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, second);
    assert_eq!(contents.lines().count(), 1);
}

/// Write failure surfaces as an error, not a panic
#[test]
fn config_write_failure_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("subdir").join("rc");

    assert!(write_config_file(&path, "patchbayd").is_err());
}
