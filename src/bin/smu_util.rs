//! Command line tool for M1000 units.
//!
//! ```bash
//! smu-util list
//! smu-util stream --mode svmi --value 2.5 --samples 1000
//! smu-util calibration write cal.txt
//! ```
//!
//! Without the `usb` feature every command runs against a simulated bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use smu::{ChannelId, Mode, Result, Session, SessionConfig, SimulatedBus};

#[derive(Parser)]
#[command(name = "smu-util")]
#[command(about = "Inspect, stream from and maintain ADALM1000 units", long_about = None)]
struct Cli {
    /// More output; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use a simulated bus with this many units
    #[arg(long, global = true)]
    simulate: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected units
    List,

    /// Report units as they are plugged in and out
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Stream samples from every unit
    Stream {
        #[arg(long, default_value_t = 1000)]
        samples: usize,

        /// Mode of channel A
        #[arg(long, value_enum, default_value_t = CliMode::Hiz)]
        mode: CliMode,

        /// Constant output of channel A, in volts or amps
        #[arg(long, default_value_t = 0.0)]
        value: f32,

        #[arg(long, default_value_t = 0)]
        rate: u32,
    },

    /// Show or change stored calibration
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },

    /// Flash a firmware image onto every unit
    Flash {
        image: PathBuf,

        /// Only flash the unit with this serial; repeatable
        #[arg(long)]
        serial: Vec<String>,
    },
}

#[derive(Subcommand)]
enum CalibrationAction {
    Show,
    /// Reset to unity gain and zero offset
    Reset,
    Write { file: PathBuf },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMode {
    Hiz,
    Svmi,
    Simv,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Mode {
        match mode {
            CliMode::Hiz => Mode::HiZ,
            CliMode::Svmi => Mode::Svmi,
            CliMode::Simv => Mode::Simv,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    smu::init_logging(level);

    if let Err(e) = run(cli) {
        eprintln!("smu-util: {}", e);
        std::process::exit(1);
    }
}

fn open_session(simulate: Option<usize>, config: SessionConfig) -> Result<Session> {
    #[cfg(feature = "usb")]
    {
        if simulate.is_none() {
            return Session::open(config);
        }
    }
    let bus = SimulatedBus::with_devices(simulate.unwrap_or(1));
    Session::new(Arc::new(bus), config)
}

fn run(cli: Cli) -> Result<()> {
    let hotplug = matches!(cli.command, Commands::Watch { .. });
    let config = SessionConfig::default().with_hotplug(hotplug);
    let session = open_session(cli.simulate, config)?;

    match cli.command {
        Commands::List => list(&session),
        Commands::Watch { seconds } => watch(&session, seconds),
        Commands::Stream {
            samples,
            mode,
            value,
            rate,
        } => stream(&session, samples, mode.into(), value, rate),
        Commands::Calibration { action } => calibration(&session, action),
        Commands::Flash { image, serial } => {
            session.add_all()?;
            let targets: Vec<_> = session
                .devices()
                .into_iter()
                .filter(|d| serial.iter().any(|s| s == d.serial()))
                .collect();
            if targets.len() < serial.len() {
                return Err(smu::Error::session("no unit with that serial", libc::ENXIO));
            }
            let flashed = session.flash_firmware(&image, &targets)?;
            println!("flashed {} unit(s), replug them to boot the new firmware", flashed);
            Ok(())
        }
    }
}

fn list(session: &Session) -> Result<()> {
    session.scan()?;
    let devices = session.available_devices();
    if devices.is_empty() {
        println!("no units found");
    }
    for device in devices {
        println!(
            "{}: hw {} fw {} ({} Hz)",
            device.serial(),
            device.hw_version(),
            device.fw_version(),
            device.sample_rate()
        );
    }
    Ok(())
}

fn watch(session: &Session, seconds: Option<u64>) -> Result<()> {
    session.hotplug_attach(|device| println!("attached: {} (fw {})", device.serial(), device.fw_version()));
    session.hotplug_detach(|device| println!("detached: {}", device.serial()));
    session.scan()?;
    for device in session.available_devices() {
        println!("present: {}", device.serial());
    }

    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(200));
        if let Some(limit) = seconds {
            if started.elapsed() >= Duration::from_secs(limit) {
                return Ok(());
            }
        }
    }
}

fn stream(session: &Session, samples: usize, mode: Mode, value: f32, rate: u32) -> Result<()> {
    session.add_all()?;
    let devices = session.devices();
    if devices.is_empty() {
        println!("no units found");
        return Ok(());
    }
    let realized = session.configure(rate)?;
    eprintln!("streaming {} samples at {} Hz", samples, realized);

    for device in devices.iter() {
        let channel = device.channel(ChannelId::A);
        channel.set_mode(mode)?;
        if mode.is_sourcing() {
            channel.constant(value)?;
        }
    }

    session.start(0)?;
    let mut left = vec![samples; devices.len()];
    while left.iter().any(|&n| n > 0) {
        for (device, left) in devices.iter().zip(left.iter_mut()) {
            if *left == 0 {
                continue;
            }
            for sample in device.read((*left).min(1000), 100)? {
                let [a, b] = sample.channels;
                println!(
                    "{}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
                    device.serial(),
                    a[0],
                    a[1],
                    b[0],
                    b[1]
                );
                *left -= 1;
            }
        }
    }
    session.end()
}

fn calibration(session: &Session, action: CalibrationAction) -> Result<()> {
    session.scan()?;
    for device in session.available_devices() {
        match &action {
            CalibrationAction::Show => {
                println!("{}:", device.serial());
                for row in device.calibration() {
                    println!("  {:>9.4} {:>9.4} {:>9.4}", row[0], row[1], row[2]);
                }
            }
            CalibrationAction::Reset => {
                device.write_calibration(None)?;
                println!("{}: calibration reset", device.serial());
            }
            CalibrationAction::Write { file } => {
                device.write_calibration(Some(file.as_path()))?;
                println!("{}: calibration written", device.serial());
            }
        }
    }
    Ok(())
}
