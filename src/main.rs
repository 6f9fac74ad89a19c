//! Soundbridge - command line probe for the patchbay backend
//!
//! Lists drivers and devices, prints the startup command a configuration
//! would produce, and can run a short demo session against the in-process
//! dummy server.

use std::sync::Arc;

use anyhow::Result;
use soundbridge::server::discovery;
use soundbridge::{
    DummyServer, EngineCallbacks, PatchbayBackend, ProcessControl, ServerConnection,
};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("soundbridge=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut driver: Option<String> = None;
    let mut device: Option<String> = None;
    let mut sample_rate: u32 = soundbridge::DEFAULT_SAMPLE_RATE;
    let mut demo = false;
    let mut dry_run = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => {
                list_drivers_and_devices();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("soundbridge {}", soundbridge::VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--driver" | "-d" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --driver requires a name");
                    return Ok(());
                }
                driver = Some(args[i + 1].clone());
                i += 2;
                continue;
            }
            "--device" | "-D" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --device requires a name");
                    return Ok(());
                }
                device = Some(args[i + 1].clone());
                i += 2;
                continue;
            }
            "--sample-rate" | "-r" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --sample-rate requires a value");
                    return Ok(());
                }
                match args[i + 1].parse() {
                    Ok(rate) => sample_rate = rate,
                    Err(_) => {
                        eprintln!("Error: invalid sample rate: {}", args[i + 1]);
                        return Ok(());
                    }
                }
                i += 2;
                continue;
            }
            "--dry-run" => {
                dry_run = true;
                i += 1;
            }
            "--demo" => {
                demo = true;
                i += 1;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
    }

    if dry_run {
        return print_command_line(driver, device, sample_rate);
    }

    if demo {
        return run_demo(sample_rate);
    }

    print_help();
    Ok(())
}

fn print_help() {
    println!("soundbridge {} - patchbay backend probe", soundbridge::VERSION);
    println!();
    println!("Usage: soundbridge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list             List drivers and their devices");
    println!("  -d, --driver <NAME>    Driver for --dry-run");
    println!("  -D, --device <NAME>    Device for --dry-run");
    println!("  -r, --sample-rate <HZ> Sample rate (default 48000)");
    println!("      --dry-run          Print the server startup command line");
    println!("      --demo             Run a short session against the dummy server");
    println!("  -V, --version          Print version");
    println!("  -h, --help             Show this help");
}

fn list_drivers_and_devices() {
    for driver in discovery::audio_driver_names() {
        println!("{}", driver);
        let devices = discovery::devices_for_driver(&driver);
        if devices.is_empty() {
            println!("  (no devices found)");
        }
        for device in devices {
            println!("  {}", device);
        }
    }

    match discovery::default_server_path() {
        Some(path) => println!("\nserver executable: {}", path.display()),
        None => println!("\nserver executable: not found"),
    }
}

fn print_command_line(driver: Option<String>, device: Option<String>, sample_rate: u32) -> Result<()> {
    let device = device.unwrap_or_default();
    let options = discovery::CommandLineOptions {
        server_path: discovery::default_server_path()
            .unwrap_or_else(|| "patchbayd".into()),
        driver: driver.unwrap_or_else(discovery::default_audio_driver),
        input_device: device.clone(),
        output_device: device,
        sample_rate,
        ..Default::default()
    };

    match discovery::build_command_line(&options) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("cannot build command line: {}", e),
    }
    Ok(())
}

/// Counting engine for the demo session
struct DemoEngine {
    cycles: std::sync::atomic::AtomicU64,
}

impl EngineCallbacks for DemoEngine {
    fn process(&self, _frames: u32) -> ProcessControl {
        self.cycles
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ProcessControl::Continue
    }
}

fn run_demo(sample_rate: u32) -> Result<()> {
    let server = DummyServer::new(sample_rate, soundbridge::DEFAULT_BUFFER_SIZE);
    server.add_system_ports(2, 2);

    let connection = ServerConnection::new(server.connector(), "soundbridge-demo");
    let engine = Arc::new(DemoEngine {
        cycles: std::sync::atomic::AtomicU64::new(0),
    });
    let backend = PatchbayBackend::new(connection, engine.clone());

    backend.set_driver(discovery::DUMMY_DRIVER)?;
    backend.start(false)?;

    info!(
        sample_rate = backend.sample_rate(),
        buffer_size = backend.buffer_size(),
        "demo session running"
    );

    for _ in 0..16 {
        server.run_cycle(backend.buffer_size());
    }

    let processed = engine.cycles.load(std::sync::atomic::Ordering::Relaxed);
    backend.stop()?;

    println!(
        "processed {} cycles at {} Hz, {} frames each",
        processed,
        sample_rate,
        soundbridge::DEFAULT_BUFFER_SIZE
    );
    Ok(())
}
