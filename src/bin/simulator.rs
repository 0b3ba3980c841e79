use cdh_core::config::CdhConfig;
use cdh_core::protocol::{parse_uplink, CommandResponse, ResponseStatus, Uplink};
use cdh_core::telemetry::{hex, ChannelSink, FixedAnalog, TelemetryFrame, TelemetrySink, TracingSink};
use cdh_core::FlightSoftware;
use clap::{App, Arg, ArgMatches};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("cdh-sim")
        .version("0.1.0")
        .about("🛰️  C&DH flight software simulator: uplink JSON on stdin, downlink frames on stdout")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Onboard clock tick period in milliseconds")
                .takes_value(true)
                .validator(is_number),
        )
        .arg(
            Arg::with_name("stream")
                .long("stream")
                .help("Enable the periodic environmental telemetry stream"),
        )
        .arg(
            Arg::with_name("link-poll-ms")
                .long("link-poll-ms")
                .value_name("MS")
                .help("Poll the COMM link every MS milliseconds while in Safe or Link")
                .takes_value(true)
                .validator(is_number),
        )
        .arg(
            Arg::with_name("sink")
                .long("sink")
                .value_name("SINK")
                .help("Where downlink frames go")
                .takes_value(true)
                .possible_values(&["stdout", "json", "log"])
                .default_value("stdout"),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after SECONDS instead of waiting for Ctrl+C")
                .takes_value(true)
                .validator(is_number),
        )
        .get_matches();

    let config = build_config(&matches)?;

    println!("🛰️  C&DH Flight Software Simulator");
    println!("==================================");

    let format = matches.value_of("sink").unwrap_or("stdout").to_string();
    let (sink, printer): (Arc<dyn TelemetrySink>, _) = if format == "log" {
        (Arc::new(TracingSink), None)
    } else {
        let (sink, frames) = ChannelSink::new();
        (Arc::new(sink), Some(tokio::spawn(print_frames(frames, format == "json"))))
    };

    let fsw = FlightSoftware::start(config, sink, Arc::new(FixedAnalog::default()))?;
    let responder = tokio::spawn(print_responses(fsw.subscribe()));

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let duration = matches
        .value_of("duration")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let deadline = tokio::time::sleep(duration.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => submit_line(&fsw, line.trim()),
                Ok(None) => {
                    info!("uplink closed");
                    if duration.is_none() {
                        break;
                    }
                    // Keep the software running until the deadline.
                    (&mut deadline).await;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read uplink");
                    break;
                }
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let stats = fsw.scheduler_stats();
    let dispatch = fsw.dispatch_stats();
    println!(
        "{} mode {:?}, {} forwarded, {} rejected, {} scheduled, {} released",
        "📊".cyan(),
        fsw.satellite_mode(),
        dispatch.forwarded,
        dispatch.rejected,
        stats.total_scheduled,
        stats.total_released,
    );
    fsw.shutdown();
    responder.abort();
    if let Some(printer) = printer {
        printer.abort();
    }
    println!("🚀 Simulator stopped");

    Ok(())
}

fn is_number(value: String) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| "must be a whole number".to_string())
}

fn build_config(matches: &ArgMatches) -> Result<CdhConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => CdhConfig::load(path)?,
        None => CdhConfig::default(),
    };
    if let Some(tick) = matches.value_of("tick-ms") {
        config.tick_period_ms = tick.parse()?;
    }
    if matches.is_present("stream") {
        config.telemetry_stream.enabled = true;
    }
    if let Some(period) = matches.value_of("link-poll-ms") {
        config.link_poll_ms = Some(period.parse()?);
    }
    config.validate()?;
    Ok(config)
}

fn submit_line(fsw: &FlightSoftware, line: &str) {
    if line.is_empty() {
        return;
    }
    let result = match parse_uplink(line) {
        Ok(Uplink::Command(envelope)) => {
            info!(destination = envelope.destination, command_id = envelope.command_id, "📨 uplink command");
            fsw.submit(envelope)
        }
        Ok(Uplink::Diary(diary)) => {
            info!(entries = diary.len(), "📨 uplink diary");
            fsw.submit_diary(diary)
        }
        Err(e) => {
            println!("{} {}", "❌".red(), format!("Invalid uplink: {e}").bright_red());
            return;
        }
    };
    if let Err(e) = result {
        println!("{} {}", "❌".red(), format!("Uplink refused: {e}").bright_red());
    }
}

async fn print_frames(mut frames: mpsc::UnboundedReceiver<TelemetryFrame>, json: bool) {
    while let Some(frame) = frames.recv().await {
        if json {
            match serde_json::to_string(&frame) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode frame"),
            }
        } else {
            println!("{} {}", "📡".blue(), hex(&frame.bytes).bright_white());
        }
    }
}

async fn print_responses(mut responses: broadcast::Receiver<CommandResponse>) {
    loop {
        match responses.recv().await {
            Ok(response) => {
                let line = format!(
                    "dest {} cmd {} @{}",
                    response.destination, response.command_id, response.timestamp
                );
                match response.status {
                    ResponseStatus::Acknowledged => println!("{} {}", "✅".green(), line.bright_green()),
                    ResponseStatus::Scheduled => println!("{} {}", "⏰".yellow(), line.bright_yellow()),
                    ResponseStatus::NegativeAck => println!(
                        "{} {} {}",
                        "❌".red(),
                        line.bright_red(),
                        response.reason.unwrap_or_default()
                    ),
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "responses lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
