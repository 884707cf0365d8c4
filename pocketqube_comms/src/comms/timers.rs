// One-shot deferred-command timers. At most one timer per class is ever
// pending; scheduling a class aborts the previous timer, which drops the
// packet it owned.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use link_protocol::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClass {
    LoraState,
    CryExp,
}

#[derive(Default)]
pub struct DeferredTimers {
    lora_state: Option<JoinHandle<()>>,
    cry_exp: Option<JoinHandle<()>>,
}

impl DeferredTimers {
    fn slot(&mut self, class: TimerClass) -> &mut Option<JoinHandle<()>> {
        match class {
            TimerClass::LoraState => &mut self.lora_state,
            TimerClass::CryExp => &mut self.cry_exp,
        }
    }

    pub fn cancel(&mut self, class: TimerClass) {
        if let Some(handle) = self.slot(class).take() {
            handle.abort();
            debug!(?class, "deferred command cancelled");
        }
    }

    /// Arm `class` to push `packet` onto the CMD queue after `delay`.
    pub fn schedule(
        &mut self,
        class: TimerClass,
        delay: Duration,
        packet: Packet,
        cmd_queue: mpsc::Sender<Packet>,
    ) {
        self.cancel(class);
        *self.slot(class) = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            if cmd_queue.try_send(packet).is_err() {
                warn!(?class, "CMD queue full, deferred command lost");
            }
        }));
    }
}

impl Drop for DeferredTimers {
    fn drop(&mut self) {
        self.cancel(TimerClass::LoraState);
        self.cancel(TimerClass::CryExp);
    }
}
