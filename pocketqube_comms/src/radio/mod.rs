// radio driver surface (SX127x-class modem contract)

pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

use thiserror::Error;

/// Modem configuration applied by `Radio::begin` and adjustable online.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraParams {
    pub frequency_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub sync_word: u8,
    pub output_power_dbm: i8,
    pub preamble_symbols: u16,
    pub agc: bool,
}

impl Default for LoraParams {
    fn default() -> Self {
        Self {
            frequency_mhz: 436.0,
            bandwidth_khz: 125.0,
            spreading_factor: 10,
            coding_rate: 5,
            sync_word: 0x12, // private-network sync word
            output_power_dbm: 10,
            preamble_symbols: 8,
            agc: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Idle,
    Listening,
    Transmitting,
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("{0} out of range")]
    Range(&'static str),
    #[error("no received frame pending")]
    NoFrame,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Narrow surface over the half-duplex modem. Completion of a reception or
/// transmission is signalled out-of-band through the shared `Notify` handed
/// to the driver at construction (the interrupt line, in effect); the
/// driver never touches COMMS state.
#[allow(async_fn_in_trait)]
pub trait Radio: Send + 'static {
    /// Idempotent full configuration. Blocks until the modem answers.
    async fn begin(&mut self, params: &LoraParams) -> Result<(), RadioError>;

    /// Enter continuous receive; each arriving frame fires the notification.
    async fn start_receive(&mut self) -> Result<(), RadioError>;

    /// One-shot transmission; returns immediately, the notification fires
    /// on completion.
    async fn start_transmit(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    /// Take the most recently received frame.
    async fn read_data(&mut self) -> Result<Vec<u8>, RadioError>;

    fn set_frequency(&mut self, mhz: f32) -> Result<(), RadioError>;
    fn set_bandwidth(&mut self, khz: f32) -> Result<(), RadioError>;
    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError>;
    fn set_coding_rate(&mut self, cr: u8) -> Result<(), RadioError>;
    fn set_output_power(&mut self, dbm: i8) -> Result<(), RadioError>;

    fn rssi(&self) -> f32;
    fn snr(&self) -> f32;
    fn frequency_error(&self) -> f32;
}

pub(crate) fn check_params(params: &LoraParams) -> Result<(), RadioError> {
    if !(400.0..=500.0).contains(&params.frequency_mhz) {
        return Err(RadioError::Range("frequency"));
    }
    if ![62.5, 125.0, 250.0, 500.0].contains(&params.bandwidth_khz) {
        return Err(RadioError::Range("bandwidth"));
    }
    if !(6..=12).contains(&params.spreading_factor) {
        return Err(RadioError::Range("spreading factor"));
    }
    if !(5..=8).contains(&params.coding_rate) {
        return Err(RadioError::Range("coding rate"));
    }
    if !(-4..=17).contains(&params.output_power_dbm) {
        return Err(RadioError::Range("output power"));
    }
    Ok(())
}
