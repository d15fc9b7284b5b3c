/// SolarEdge inverter simulator
///
/// Serves a SunSpec register image over Modbus-TCP with slowly varying values, for
/// running the gateway without hardware. Usage: `inverter_simulator [bind_addr]`,
/// default `127.0.0.1:1502`.

use std::time::Duration;

use anyhow::Result;
use env_logger::Env;
use log::info;
use tokio::signal;
use tokio::time::interval;

use sunspec_gateway::sunspec::to_fixed;
use sunspec_gateway::{InverterSimulator, RawRegisterBlock};

const DEFAULT_BIND: &str = "127.0.0.1:1502";

fn initial_image() -> RawRegisterBlock {
    RawRegisterBlock {
        manufacturer: to_fixed("SolarEdge "),
        model: to_fixed("SE5000H-RW000BNN4"),
        version: to_fixed("0004.0014.0158"),
        serial_number: to_fixed("7E0A1B2C"),
        phase: 101,
        ac_current_sf: -2,
        ac_voltage_an: 2301,
        ac_voltage_sf: -1,
        ac_frequency: 4999,
        ac_frequency_sf: -2,
        ac_pf: 10000,
        ac_pf_sf: -2,
        ac_energy_wh: 12_345_678,
        ac_energy_wh_sf: 0,
        dc_voltage: 3800,
        dc_voltage_sf: -1,
        dc_current_sf: -3,
        temp_sf: -2,
        // MPPT
        status: 4,
        ..Default::default()
    }
}

/// Advance the image by one second of a sine-shaped production curve
fn step(image: &mut RawRegisterBlock, tick: u64) {
    let phase = (tick % 600) as f64 / 600.0 * std::f64::consts::TAU;
    let power = 2500.0 + 2000.0 * phase.sin();

    image.ac_power = power as i16;
    image.ac_va = power as i16;
    image.ac_var = 0;
    image.ac_current = (power / 230.1 * 100.0) as u16;
    image.ac_current_a = image.ac_current;
    image.dc_power = (power * 1.03) as i16;
    image.dc_current = (power * 1.03 / 380.0 * 1000.0) as u16;
    image.temp_sink = (3500.0 + power / 2.0) as i16;
    // Wh accumulated over one second
    image.ac_energy_wh = image.ac_energy_wh.wrapping_add((power / 3600.0).round() as u32);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let bind = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_BIND.to_string());

    let mut simulator = InverterSimulator::new(&bind)?;
    simulator.set_image(initial_image()).await;
    let addr = simulator.start().await?;
    info!("Simulated SolarEdge inverter on {}", addr);

    let image = simulator.image();
    let mut ticker = interval(Duration::from_secs(1));
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = ticker.tick() => {
                step(&mut *image.lock().await, tick);
                tick += 1;
                if tick % 60 == 0 {
                    let stats = simulator.stats().await;
                    info!(
                        "clients={} requests={} exceptions={}",
                        stats.connections_count, stats.total_requests, stats.exception_responses
                    );
                }
            }
        }
    }

    simulator.stop().await;
    Ok(())
}
