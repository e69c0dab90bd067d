//! Bring a tracker up, register tools, poll a fixed number of `BX` frames
//! and print every handle's pose as it arrives.

use clap::Parser;
use log::{error, info, warn};
use nditrack::{
    args::TrackArgs,
    config::TrackerConfig,
    driver::Driver,
    error::{NdiError, Result},
    tool_definition::ToolDefinition,
    transport::{SerialTransport, DEFAULT_BAUD_RATE},
};
use std::process::ExitCode;

// Example:
// cargo run --bin ndi-track --
//                            --port   /dev/ttyUSB0
//                            --device polaris
//                            --baud   115200
//                            --tool   8700339.rom
//                            --frames 200

fn main() -> ExitCode {
    env_logger::init();
    let args = TrackArgs::parse();

    let result = if args.list_ports {
        list_ports()
    } else {
        args.into_config().and_then(track)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn list_ports() -> Result<()> {
    println!("Available devices:");
    for port in SerialTransport::available_ports()? {
        println!("\t{}", port.to_string_lossy());
    }
    Ok(())
}

fn track(config: TrackerConfig) -> Result<()> {
    let port = config.port.clone().ok_or_else(|| {
        NdiError::InvalidArgument("no serial port, pass --port or set it in the config".to_owned())
    })?;

    let transport = SerialTransport::new(&port, DEFAULT_BAUD_RATE);
    let mut driver = Driver::new(transport, config.device).with_settle_delay(config.settle_delay());
    driver.open()?;
    driver.init()?;
    if config.baud_rate.bps() != DEFAULT_BAUD_RATE {
        driver.set_baud_rate(config.baud_rate)?;
    }

    driver.free_port_handles()?;
    for path in &config.tool_files {
        let tool = ToolDefinition::from_path(path)?;
        let id = driver.add_wireless_tool(&tool)?;
        info!("{} is port handle {}", path.display(), id);
    }
    driver.detect_and_assign_port_handles()?;
    driver.init_all_port_handles()?;
    driver.enable_all_port_handles(config.enable_mode)?;
    if driver.n_port_handles() == 0 {
        warn!("No port handles, only stray markers will be reported");
    }

    driver.start_tracking()?;
    let interval = config.poll_interval()?;
    for _ in 0..config.frames {
        let frame = driver.bx(config.reply_options)?;
        for record in &frame.records {
            if let Some(handle) = driver.get_port_handle(&record.id) {
                println!("{}", handle);
            }
        }
        for (i, marker) in driver.stray_markers().iter().enumerate() {
            println!("stray {}: {:?}", i, marker);
        }
        spin_sleep::sleep(interval);
    }
    driver.stop_tracking()?;
    driver.close()
}
