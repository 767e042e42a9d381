use std::{sync::Arc, time::Duration};

use crate::{
    gpu::{FenceId, FenceWait, RenderDevice},
    Error, Result,
};

/// Single monotonic fence gating CPU reuse of GPU-resident buffers.
///
/// Every [`signal`](Self::signal) is followed by a [`wait_until_current`](Self::wait_until_current)
/// before the CPU touches anything the submitted work reads, so at most one batch is in flight.
pub struct FrameSync<D: RenderDevice> {
    device: Arc<D>,
    fence: FenceId,
    next_value: u64,
    last_signaled: u64,
    timeout: Option<Duration>,
}

impl<D: RenderDevice> FrameSync<D> {
    pub fn new(device: &Arc<D>, timeout: Option<Duration>) -> Result<Self> {
        let fence = device
            .create_fence(0)
            .map_err(|e| Error::creation("frame fence", e))?;

        Ok(Self {
            device: device.clone(),
            fence,
            next_value: 1,
            last_signaled: 0,
            timeout,
        })
    }

    /// Has the queue write the next counter value once all prior work completes.
    pub fn signal(&mut self) -> Result<u64> {
        let value = self.next_value;
        self.device
            .signal_fence(self.fence, value)
            .map_err(Error::Submission)?;
        self.last_signaled = value;
        self.next_value += 1;

        Ok(value)
    }

    /// Blocks until the fence reaches the last signaled value.
    pub fn wait_until_current(&self) -> Result<()> {
        let completed = self
            .device
            .fence_completed_value(self.fence)
            .map_err(Error::Submission)?;
        if completed >= self.last_signaled {
            return Ok(());
        }

        match self
            .device
            .wait_for_fence(self.fence, self.last_signaled, self.timeout)
            .map_err(Error::Submission)?
        {
            FenceWait::Reached => Ok(()),
            FenceWait::TimedOut => {
                log::error!(
                    "Fence stuck at {completed}, expected {}",
                    self.last_signaled
                );
                Err(Error::DeviceLost {
                    expected: self.last_signaled,
                    timeout: self.timeout.unwrap_or_default(),
                })
            }
        }
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }
}

impl<D: RenderDevice> Drop for FrameSync<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}
