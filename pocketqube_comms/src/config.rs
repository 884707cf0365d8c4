// Runtime configuration: link addresses, beacon cadence, LoRa defaults.

use anyhow::Result;
use clap::Parser;

use crate::radio::LoraParams;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub peer_addr: String,
    pub beacon_secs: u64,
    pub lora: LoraParams,
}

#[derive(Parser, Debug, Clone)]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0:7878")]
    pub bind_addr: String,
    #[arg(long, default_value = "127.0.0.1:7879")]
    pub peer_addr: String,
    #[arg(long, default_value_t = 30)]
    pub beacon_secs: u64,
    #[arg(long, default_value_t = 436.0)]
    pub frequency_mhz: f32,
    #[arg(long, default_value_t = 125.0)]
    pub bandwidth_khz: f32,
    #[arg(long, default_value_t = 10)]
    pub spreading_factor: u8,
    #[arg(long, default_value_t = 5)]
    pub coding_rate: u8,
    #[arg(long, default_value_t = 10)]
    pub output_power_dbm: i8,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Config> {
        let c = <Cli as Parser>::parse();
        Ok(Config {
            bind_addr: c.bind_addr,
            peer_addr: c.peer_addr,
            beacon_secs: c.beacon_secs,
            lora: LoraParams {
                frequency_mhz: c.frequency_mhz,
                bandwidth_khz: c.bandwidth_khz,
                spreading_factor: c.spreading_factor,
                coding_rate: c.coding_rate,
                output_power_dbm: c.output_power_dbm,
                ..LoraParams::default()
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            peer_addr: "127.0.0.1:7879".into(),
            beacon_secs: 30,
            lora: LoraParams::default(),
        }
    }
}
