pub mod handler;

pub use handler::{ack_needed, ack_needed_before, execute_tec};
