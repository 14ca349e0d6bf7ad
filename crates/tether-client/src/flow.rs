// Admission control on resident in-flight messages, by count and by bytes.
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_MAX_OUTSTANDING_MESSAGES: u64 = 1000;
const DEFAULT_MAX_OUTSTANDING_BYTES: u64 = 100 * 1024 * 1024;

/// What to do when a reservation would exceed a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBehavior {
    /// Wait (FIFO-fairly) until enough reservations are released.
    Block,
    /// Deliver anyway, without accounting for the message.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct FlowControlSettings {
    /// `None` means unlimited.
    pub max_outstanding_messages: Option<u64>,
    /// `None` means unlimited.
    pub max_outstanding_bytes: Option<u64>,
    pub on_limit: LimitBehavior,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: Some(DEFAULT_MAX_OUTSTANDING_MESSAGES),
            max_outstanding_bytes: Some(DEFAULT_MAX_OUTSTANDING_BYTES),
            on_limit: LimitBehavior::Block,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("flow controller closed")]
    Closed,
}

/// Gates message reception so resident memory and concurrency stay bounded.
///
/// Reservations are RAII: dropping a [`Reservation`] releases its share and
/// wakes blocked reservers. `close` unblocks every waiter at shutdown.
pub struct FlowController {
    messages: Option<Arc<Semaphore>>,
    bytes: Option<Arc<Semaphore>>,
    byte_permits: u32,
    behavior: LimitBehavior,
}

/// Held share of the flow limits; releasing is dropping.
#[derive(Default)]
pub struct Reservation {
    _message_permit: Option<OwnedSemaphorePermit>,
    _byte_permit: Option<OwnedSemaphorePermit>,
}

impl FlowController {
    pub fn new(settings: FlowControlSettings) -> anyhow::Result<Self> {
        if settings.max_outstanding_messages == Some(0) {
            anyhow::bail!("max_outstanding_messages must be positive or unlimited");
        }
        if settings.max_outstanding_bytes == Some(0) {
            anyhow::bail!("max_outstanding_bytes must be positive or unlimited");
        }
        // Semaphore permits are u32-addressable; clamp enormous byte limits.
        let byte_permits = settings
            .max_outstanding_bytes
            .map(|limit| limit.min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        Ok(Self {
            messages: settings
                .max_outstanding_messages
                .map(|limit| {
                    let permits = limit.min(Semaphore::MAX_PERMITS as u64) as usize;
                    Arc::new(Semaphore::new(permits))
                }),
            bytes: settings
                .max_outstanding_bytes
                .map(|_| Arc::new(Semaphore::new(byte_permits as usize))),
            byte_permits,
            behavior: settings.on_limit,
        })
    }

    /// Reserve room for `count` messages totalling `bytes`.
    ///
    /// A single message larger than the byte limit is clamped to the limit so
    /// it can still be admitted once the controller drains.
    pub async fn reserve(&self, count: u32, bytes: u64) -> Result<Reservation, FlowError> {
        let byte_count = bytes.min(self.byte_permits as u64) as u32;
        match self.behavior {
            LimitBehavior::Block => {
                let message_permit = match &self.messages {
                    Some(semaphore) => Some(
                        Arc::clone(semaphore)
                            .acquire_many_owned(count)
                            .await
                            .map_err(|_| FlowError::Closed)?,
                    ),
                    None => None,
                };
                let byte_permit = match &self.bytes {
                    Some(semaphore) => Some(
                        Arc::clone(semaphore)
                            .acquire_many_owned(byte_count)
                            .await
                            .map_err(|_| FlowError::Closed)?,
                    ),
                    None => None,
                };
                Ok(Reservation {
                    _message_permit: message_permit,
                    _byte_permit: byte_permit,
                })
            }
            LimitBehavior::Ignore => {
                let message_permit = match &self.messages {
                    Some(semaphore) => {
                        match Arc::clone(semaphore).try_acquire_many_owned(count) {
                            Ok(permit) => Some(permit),
                            Err(tokio::sync::TryAcquireError::NoPermits) => {
                                return Ok(Reservation::default());
                            }
                            Err(tokio::sync::TryAcquireError::Closed) => {
                                return Err(FlowError::Closed);
                            }
                        }
                    }
                    None => None,
                };
                let byte_permit = match &self.bytes {
                    Some(semaphore) => {
                        match Arc::clone(semaphore).try_acquire_many_owned(byte_count) {
                            Ok(permit) => Some(permit),
                            Err(tokio::sync::TryAcquireError::NoPermits) => {
                                // The message permit drops here, keeping the
                                // two counters consistent.
                                return Ok(Reservation::default());
                            }
                            Err(tokio::sync::TryAcquireError::Closed) => {
                                return Err(FlowError::Closed);
                            }
                        }
                    }
                    None => None,
                };
                Ok(Reservation {
                    _message_permit: message_permit,
                    _byte_permit: byte_permit,
                })
            }
        }
    }

    /// Unblock every waiter; subsequent reservations fail with `Closed`.
    pub fn close(&self) {
        if let Some(semaphore) = &self.messages {
            semaphore.close();
        }
        if let Some(semaphore) = &self.bytes {
            semaphore.close();
        }
    }
}
