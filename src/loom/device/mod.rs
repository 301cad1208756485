use derive_more::{Display, From, Into};
use thiserror::Error;

use super::{memory::MemoryError, program::IterationProgram};

pub use emulator::{Emulator, EmulatorBuilder};

pub mod emulator;

/// Deepest loop nest the accelerator hardware accepts.
pub const MAX_LOOP_DEPTH: usize = 10;

/// Register channel on which the issuing core receives completion notifications.
pub const COMPLETION_CHANNEL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device memory error: {0}")]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("program of depth {depth} exceeds the accelerator limit of {max}")]
    TooDeep { depth: usize, max: usize },
    #[error("accelerator failed: {0}")]
    Device(#[from] DeviceError),
    #[error("accelerator hung up before signalling completion")]
    Disconnected,
    #[error("completion for {actual} received while waiting at {expected}")]
    Misaddressed {
        expected: NotificationAddress,
        actual: NotificationAddress,
    },
}

/// Identity of an execution context (a core) that issues accelerator work.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct CoreId(pub u32);

/// Point-to-point address at which one core receives completion signals.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("core {core} channel {channel}")]
pub struct NotificationAddress {
    pub core: CoreId,
    pub channel: u8,
}

impl NotificationAddress {
    /// The completion address of the issuing `core`.
    #[inline]
    pub fn completion(core: CoreId) -> Self {
        let channel = COMPLETION_CHANNEL;
        Self { core, channel }
    }
}

/// Sent by the accelerator exactly once per submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub address: NotificationAddress,
    pub result: Result<(), DeviceError>,
}

/// The accelerator's handle for signalling a submission's completion.
#[derive(Debug, Clone)]
pub struct Notifier {
    address: NotificationAddress,
    sender: flume::Sender<Completion>,
}

impl Notifier {
    #[inline]
    pub fn address(&self) -> NotificationAddress {
        self.address
    }

    /// Signals completion. The waiter may already be gone, which is fine.
    #[inline]
    pub fn notify(self, result: Result<(), DeviceError>) {
        let address = self.address;
        _ = self.sender.send(Completion { address, result });
    }
}

/// A fixed-function accelerator executing iteration programs.
pub trait Accelerator {
    /// Deepest program accepted by [`Accelerator::submit`].
    fn max_depth(&self) -> usize {
        MAX_LOOP_DEPTH
    }

    /// Starts executing `program`; `notifier` must be signalled once it finishes.
    fn submit(&self, program: IterationProgram, notifier: Notifier);
}

impl<A: Accelerator + ?Sized> Accelerator for &A {
    #[inline]
    fn max_depth(&self) -> usize {
        (**self).max_depth()
    }

    #[inline]
    fn submit(&self, program: IterationProgram, notifier: Notifier) {
        (**self).submit(program, notifier)
    }
}

/// An in-flight submission. The issuing core may do other work before waiting.
#[derive(Debug)]
#[must_use = "a submission must be waited on to observe its result"]
pub struct Pending {
    address: NotificationAddress,
    receiver: flume::Receiver<Completion>,
}

impl Pending {
    #[inline]
    pub fn address(&self) -> NotificationAddress {
        self.address
    }

    fn complete(&self, completion: Completion) -> Result<(), DispatchError> {
        if completion.address != self.address {
            return Err(DispatchError::Misaddressed {
                expected: self.address,
                actual: completion.address,
            });
        }
        Ok(completion.result?)
    }

    /// Blocks until the accelerator signals completion.
    pub fn wait(self) -> Result<(), DispatchError> {
        let completion = self
            .receiver
            .recv()
            .map_err(|_| DispatchError::Disconnected)?;
        self.complete(completion)
    }

    /// Awaits the accelerator's completion signal.
    pub async fn wait_async(self) -> Result<(), DispatchError> {
        let completion = self
            .receiver
            .recv_async()
            .await
            .map_err(|_| DispatchError::Disconnected)?;
        self.complete(completion)
    }
}

/// Hands `program` to `accelerator` on behalf of `core`.
///
/// Every call gets a fresh completion channel, so concurrent submissions never
/// share a notification target.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn submit<A: Accelerator + ?Sized>(
    accelerator: &A,
    core: CoreId,
    program: IterationProgram,
) -> Result<Pending, DispatchError> {
    let depth = program.depth();
    let max = accelerator.max_depth();
    if depth > max {
        return Err(DispatchError::TooDeep { depth, max });
    }

    let address = NotificationAddress::completion(core);
    let (sender, receiver) = flume::bounded(1);
    log::debug!("submit from {address}: {program}");
    accelerator.submit(program, Notifier { address, sender });

    Ok(Pending { address, receiver })
}
