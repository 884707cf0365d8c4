// In-memory radio double for state machine and dispatcher tests.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use super::{check_params, LoraParams, Radio, RadioError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Setting {
    Frequency(f32),
    Bandwidth(f32),
    SpreadingFactor(u8),
    CodingRate(u8),
    OutputPower(i8),
}

pub(crate) struct MockRadio {
    pub events: Arc<Notify>,
    pub inbox: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub settings: Vec<Setting>,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    pub freq_error_hz: f32,
}

impl MockRadio {
    pub fn new(events: Arc<Notify>) -> Self {
        Self {
            events,
            inbox: VecDeque::new(),
            sent: Vec::new(),
            settings: Vec::new(),
            rssi_dbm: -101.5,
            snr_db: 4.25,
            freq_error_hz: -128.0,
        }
    }

    /// Queue a frame as if it had just arrived over the air.
    pub fn receive_frame(&mut self, frame: Vec<u8>) {
        self.inbox.push_back(frame);
        self.events.notify_one();
    }
}

impl Radio for MockRadio {
    async fn begin(&mut self, params: &LoraParams) -> Result<(), RadioError> {
        check_params(params)
    }

    async fn start_receive(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn start_transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        self.sent.push(frame.to_vec());
        self.events.notify_one();
        Ok(())
    }

    async fn read_data(&mut self) -> Result<Vec<u8>, RadioError> {
        self.inbox.pop_front().ok_or(RadioError::NoFrame)
    }

    fn set_frequency(&mut self, mhz: f32) -> Result<(), RadioError> {
        self.settings.push(Setting::Frequency(mhz));
        Ok(())
    }

    fn set_bandwidth(&mut self, khz: f32) -> Result<(), RadioError> {
        self.settings.push(Setting::Bandwidth(khz));
        Ok(())
    }

    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), RadioError> {
        self.settings.push(Setting::SpreadingFactor(sf));
        Ok(())
    }

    fn set_coding_rate(&mut self, cr: u8) -> Result<(), RadioError> {
        self.settings.push(Setting::CodingRate(cr));
        Ok(())
    }

    fn set_output_power(&mut self, dbm: i8) -> Result<(), RadioError> {
        self.settings.push(Setting::OutputPower(dbm));
        Ok(())
    }

    fn rssi(&self) -> f32 {
        self.rssi_dbm
    }

    fn snr(&self) -> f32 {
        self.snr_db
    }

    fn frequency_error(&self) -> f32 {
        self.freq_error_hz
    }
}
