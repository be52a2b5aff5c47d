use clap::{App, Arg};
use colored::*;
use rangetag::sim::{Position, SimConfig, SimNetwork};
use rangetag::types::RangingRole;
use std::time::Duration;
use tokio::time;
use tracing::info;

const SLOT_INTERVAL_MS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let matches = App::new("rangetag-sim")
        .version("0.1.0")
        .about("📡 Wearable ranging tag network simulator")
        .arg(
            Arg::with_name("tags")
                .short("n")
                .long("tags")
                .value_name("COUNT")
                .help("Number of simulated tags")
                .takes_value(true)
                .default_value("3")
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if (2..=10).contains(&n) => Ok(()),
                    _ => Err("Tag count must be between 2 and 10".into()),
                }),
        )
        .arg(
            Arg::with_name("steps")
                .short("s")
                .long("steps")
                .value_name("STEPS")
                .help("Slot intervals to simulate")
                .takes_value(true)
                .default_value("600")
                .validator(|v| match v.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Steps must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for clock offsets and timestamp noise")
                .takes_value(true)
                .default_value("24301")
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Seed must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("noise")
                .long("noise")
                .value_name("TICKS")
                .help("Receive-timestamp jitter in radio ticks, plus or minus")
                .takes_value(true)
                .default_value("0")
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Noise must be a valid number".into()),
                }),
        )
        .arg(
            Arg::with_name("spread")
                .long("spread")
                .value_name("MM")
                .help("Radius of the circle the tags are placed on, in millimetres")
                .takes_value(true)
                .default_value("5000")
                .validator(|v| match v.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(()),
                    _ => Err("Spread must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("realtime")
                .long("realtime")
                .help("Pace the simulation at one slot interval per 10 ms"),
        )
        .get_matches();

    let tags: usize = matches.value_of("tags").unwrap().parse()?;
    let steps: u64 = matches.value_of("steps").unwrap().parse()?;
    let seed: u64 = matches.value_of("seed").unwrap().parse()?;
    let noise: u64 = matches.value_of("noise").unwrap().parse()?;
    let spread: f64 = matches.value_of("spread").unwrap().parse::<u64>()? as f64;
    let format = matches.value_of("format").unwrap();
    let realtime = matches.is_present("realtime");

    if format != "json" {
        println!("{}", "📡 Ranging Tag Network Simulator".bright_blue().bold());
        println!("================================");
    }

    // Tags on a circle so every pair gets a distinct distance.
    let positions: Vec<Position> = (0..tags)
        .map(|i| {
            let angle = (i as f64) * std::f64::consts::TAU / (tags as f64);
            Position::new(spread * angle.cos(), spread * angle.sin())
        })
        .collect();

    let config = SimConfig {
        seed,
        noise_ticks: noise,
        ..SimConfig::default()
    };
    let mut net = SimNetwork::new(config);
    for (i, position) in positions.iter().enumerate() {
        net.add_tag(0x10 + i as u64, *position)?;
    }

    info!(tags, steps, seed, noise, "simulation starting");

    if realtime {
        let mut interval = time::interval(Duration::from_millis(SLOT_INTERVAL_MS));
        for _ in 0..steps {
            interval.tick().await;
            net.step();
        }
    } else {
        net.run_steps(steps);
    }

    match format {
        "json" => print_json(&net, &positions, steps)?,
        "compact" => print_compact(&net),
        _ => print_table(&net, &positions),
    }

    Ok(())
}

fn measured_between(net: &SimNetwork, i: usize, j: usize) -> Option<i32> {
    // The earlier slot records the pair; accept either direction.
    net.device(i)
        .platform()
        .last_distance_to(net.device(j).id())
        .or_else(|| {
            net.device(j)
                .platform()
                .last_distance_to(net.device(i).id())
        })
}

fn print_json(
    net: &SimNetwork,
    positions: &[Position],
    steps: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let devices: Vec<serde_json::Value> = net
        .devices()
        .iter()
        .map(|d| {
            let stats = d.scheduler().get_stats();
            serde_json::json!({
                "id": d.id().to_string(),
                "role": d.app().get_role(),
                "active": d.scheduler().is_active(),
                "rounds_completed": stats.rounds_completed,
                "rounds_faulted": stats.rounds_faulted,
                "measurements": stats.measurements_produced,
            })
        })
        .collect();

    let mut links = Vec::new();
    for i in 0..net.len() {
        for j in (i + 1)..net.len() {
            links.push(serde_json::json!({
                "from": net.device(i).id().to_string(),
                "to": net.device(j).id().to_string(),
                "measured_mm": measured_between(net, i, j),
                "expected_mm": positions[i].distance_mm(&positions[j]).round() as i64,
            }));
        }
    }

    let payload = serde_json::json!({
        "steps": steps,
        "masters": net.master_count(),
        "devices": devices,
        "links": links,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn print_compact(net: &SimNetwork) {
    let active = net
        .devices()
        .iter()
        .filter(|d| d.scheduler().is_active())
        .count();
    println!(
        "{} tags, {} ranging, {} master(s)",
        net.len(),
        active,
        net.master_count()
    );
}

fn print_table(net: &SimNetwork, positions: &[Position]) {
    println!("{} {}", "🛰".bright_blue(), "Device Roles".bright_blue().bold());
    for device in net.devices() {
        let stats = device.scheduler().get_stats();
        let role = device.app().get_role();
        let role_text = match role {
            RangingRole::Master => "Master".bright_green(),
            RangingRole::Participant => "Participant".bright_cyan(),
            RangingRole::Unknown => "Unknown".yellow(),
            RangingRole::Asleep => "Asleep".dimmed(),
        };
        println!(
            "  {} {:<12} rounds={} faults={} measurements={}",
            device.id().to_string().bright_white(),
            role_text,
            stats.rounds_completed,
            stats.rounds_faulted,
            stats.measurements_produced,
        );
    }

    println!();
    println!("{} {}", "📏".bright_blue(), "Pairwise Distances".bright_blue().bold());
    for i in 0..net.len() {
        for j in (i + 1)..net.len() {
            let expected = positions[i].distance_mm(&positions[j]).round() as i64;
            let pair = format!(
                "{:02x} ↔ {:02x}",
                net.device(i).id().short(),
                net.device(j).id().short()
            );
            match measured_between(net, i, j) {
                Some(measured) => {
                    let error = (i64::from(measured) - expected).abs();
                    let measured_text = if error <= 50 {
                        format!("{measured} mm").bright_green()
                    } else if error <= 200 {
                        format!("{measured} mm").yellow()
                    } else {
                        format!("{measured} mm").bright_red()
                    };
                    println!(
                        "  {}  {}  (expected {} mm, error {} mm)",
                        pair.bright_white(),
                        measured_text,
                        expected,
                        error
                    );
                }
                None => {
                    println!(
                        "  {}  {}  (expected {} mm)",
                        pair.bright_white(),
                        "no measurement".dimmed(),
                        expected
                    );
                }
            }
        }
    }
}
