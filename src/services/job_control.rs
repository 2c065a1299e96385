use tokio::sync::watch;

use crate::errors::{LauncherError, Result};

/// Signal the scheduler sends to a running job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobControl {
    Running,
    /// Keep the slot, stop transferring.
    Paused,
    /// Stop transferring and hand the slot back; the job is re-queued.
    Suspended,
    Cancelled,
}

pub type ControlReceiver = watch::Receiver<JobControl>;

/// Waits out a pause. Returns `Running` or `Suspended`; cancellation is an error.
pub async fn wait_for_running(control: &mut ControlReceiver) -> Result<JobControl> {
    loop {
        let state = *control.borrow_and_update();
        match state {
            JobControl::Running | JobControl::Suspended => return Ok(state),
            JobControl::Cancelled => return Err(LauncherError::Cancelled),
            JobControl::Paused => {
                // A dropped sender means the scheduler is gone.
                control
                    .changed()
                    .await
                    .map_err(|_| LauncherError::Cancelled)?;
            }
        }
    }
}
