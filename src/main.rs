#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use std::env;
use std::path::PathBuf;
use std::process;

use env_logger::{Builder, Env};
use macstats::{Config, KeyDump, SmcKey, Snapshot};

fn print_usage() {
    eprintln!("Usage: macstats [OPTIONS]");
    eprintln!();
    eprintln!("SMC temperature, fan, power and voltage readings");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    --json             Output as JSON");
    eprintln!("    --dump             Read every SMC key");
    eprintln!("    --key <KEY>        Read a single SMC key, e.g. TC0P");
    eprintln!("    --config <PATH>    Load settings from a JSON file");
    eprintln!("    --help             Print this help message");
    eprintln!();
    eprintln!("The config path can also be set with ${}.", macstats::config::CONFIG_ENV);
}

enum Command {
    Snapshot,
    Dump,
    Key(SmcKey),
}

struct Args {
    command: Command,
    json: bool,
    config: Option<PathBuf>,
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!();
    print_usage();
    process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        command: Command::Snapshot,
        json: false,
        config: None,
    };

    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => args.json = true,
            "--dump" => args.command = Command::Dump,
            "--key" => {
                let Some(name) = iter.next() else {
                    fail("--key needs a value");
                };
                match name.parse() {
                    Ok(key) => args.command = Command::Key(key),
                    Err(e) => fail(&e.to_string()),
                }
            }
            "--config" => {
                let Some(path) = iter.next() else {
                    fail("--config needs a value");
                };
                args.config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            _ => fail(&format!("Unknown argument '{}'", arg)),
        }
    }

    args
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error encoding JSON: {}", e);
            process::exit(1);
        }
    }
}

fn format_reading(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.1} {}", v, unit),
        None => "-".to_string(),
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    println!("{} ({:?})", snapshot.model_name, snapshot.chip.confidence);
    if let Some(err) = &snapshot.smc_error {
        println!("  SMC unavailable: {}", err);
    }
    println!("  Temperature:");
    println!("    CPU:     {}", format_reading(snapshot.temperature.cpu, "°C"));
    println!("    CPU die: {}", format_reading(snapshot.temperature.cpu_die, "°C"));
    println!("    GPU:     {}", format_reading(snapshot.temperature.gpu, "°C"));

    println!("  Fans:");
    if snapshot.fans.is_empty() {
        println!("    none");
    }
    for fan in &snapshot.fans {
        println!(
            "    Fan {}: {} (min {}, max {})",
            fan.index,
            format_reading(fan.actual_rpm, "RPM"),
            format_reading(fan.minimum_rpm, "RPM"),
            format_reading(fan.maximum_rpm, "RPM")
        );
    }

    println!("  Power:");
    println!("    CPU:    {}", format_reading(snapshot.power.cpu, "W"));
    println!("    GPU:    {}", format_reading(snapshot.power.gpu, "W"));
    println!("    System: {}", format_reading(snapshot.power.system, "W"));

    println!("  GPU usage: {}", match snapshot.gpu_usage {
        Some(usage) => format!("{:.0}%", usage * 100.0),
        None => "-".to_string(),
    });

    println!("  Voltage:");
    println!("    CPU:    {}", format_reading(snapshot.voltage.cpu, "V"));
    println!("    GPU:    {}", format_reading(snapshot.voltage.gpu, "V"));
    println!("    Memory: {}", format_reading(snapshot.voltage.memory, "V"));

    if !snapshot.hid.temperature.is_empty() {
        println!("  HID temperature sensors:");
        for sensor in &snapshot.hid.temperature {
            println!("    {:<28} {:.1} °C", sensor.name, sensor.value);
        }
    }
}

fn print_dump(dump: &[KeyDump]) {
    for entry in dump {
        let data_type = entry
            .data_type
            .map_or_else(|| "----".to_string(), |t| t.to_string());
        let bytes: Vec<String> = entry.bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let value = match (entry.value, &entry.error) {
            (Some(v), _) => format!("{}", v),
            (None, Some(err)) => err.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{}  [{}]  {:>2}  {:<24}  {}",
            entry.key,
            data_type,
            entry.size,
            bytes.join(" "),
            value
        );
    }
}

#[cfg(target_os = "macos")]
fn run(args: Args) -> Result<(), String> {
    use macstats::Session;

    let config = Config::resolve(args.config.as_deref()).map_err(|e| e.to_string())?;
    let session = Session::system(config);

    match args.command {
        Command::Snapshot => {
            let snapshot = session.snapshot();
            if args.json {
                print_json(&snapshot);
            } else {
                print_snapshot(&snapshot);
            }
        }
        Command::Dump => {
            let dump = session.dump().map_err(|e| e.to_string())?;
            if args.json {
                print_json(&dump);
            } else {
                print_dump(&dump);
            }
        }
        Command::Key(key) => {
            let raw = session.read(key).map_err(|e| e.to_string())?;
            let value = raw.decode();
            if args.json {
                print_json(&serde_json::json!({
                    "key": raw.key(),
                    "data_type": raw.data_type(),
                    "size": raw.size(),
                    "bytes": raw.bytes(),
                    "value": value.as_ref().ok(),
                    "error": value.as_ref().err().map(|e| e.to_string()),
                }));
            } else {
                match value {
                    Ok(v) => println!("{} [{}] {}", raw.key(), raw.data_type(), v),
                    Err(e) => println!("{} [{}] {:02x?} ({})", raw.key(), raw.data_type(), raw.bytes(), e),
                }
            }
        }
    }

    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn run(args: Args) -> Result<(), String> {
    Config::resolve(args.config.as_deref()).map_err(|e| e.to_string())?;
    Err("the SMC is only available on macOS".to_string())
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("warn")).init();

    let args = parse_args();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
