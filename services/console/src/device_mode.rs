//! Device mode controller.
//!
//! The capture device runs in one of a few mutually exclusive modes. Screens
//! that need a non-default mode enter it through [`DeviceModeController::enter`]
//! or [`DeviceModeController::with_mode`], and the prior mode is requested again
//! on every exit path, including cancellation of the caller's future.
//!
//! Precondition: one controller drives one physical device, and callers do not
//! overlap scoped modes on it. Nothing here locks the device.

use crate::vision_client::{DeviceMode, VisionBackend, VisionError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

/// Tracks the last requested mode of one device
#[derive(Clone)]
pub struct DeviceModeController {
    backend: Arc<dyn VisionBackend>,
    current: Arc<Mutex<DeviceMode>>,
}

impl DeviceModeController {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self {
            backend,
            current: Arc::new(Mutex::new(DeviceMode::default())),
        }
    }

    /// Last mode the device acknowledged a request for.
    ///
    /// This is what was asked for, not an observation of the device.
    pub fn current(&self) -> DeviceMode {
        *self.current.lock()
    }

    /// Send a mode request and wait for the acknowledgement
    #[instrument(skip(self))]
    pub async fn set_mode(&self, mode: DeviceMode) -> Result<(), VisionError> {
        self.backend.set_mode(mode).await?;
        *self.current.lock() = mode;

        debug!(%mode, "Device mode set");
        Ok(())
    }

    /// Enter `mode` and return a guard that restores the prior mode.
    ///
    /// On error no mode was entered and nothing will be restored.
    pub async fn enter(&self, mode: DeviceMode) -> Result<ModeGuard, VisionError> {
        let restore_to = self.current();
        self.set_mode(mode).await?;

        Ok(ModeGuard {
            controller: self.clone(),
            restore_to,
            armed: true,
        })
    }

    /// Run `f` in `mode`, restoring the prior mode afterwards.
    ///
    /// `Err` means the mode could not be entered and `f` never ran. A failed
    /// restore is logged and does not change the returned value.
    pub async fn with_mode<F, Fut, T>(&self, mode: DeviceMode, f: F) -> Result<T, VisionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.enter(mode).await?;
        let output = f().await;
        guard.release().await;

        Ok(output)
    }

    async fn restore(&self, mode: DeviceMode) {
        match self.set_mode(mode).await {
            Ok(()) => debug!(%mode, "Device mode restored"),
            Err(e) => {
                metrics::counter!("qc.device.restore_failed").increment(1);
                warn!(%mode, error = %e, "Failed to restore device mode");
            }
        }
    }
}

/// Restores the mode that was active before [`DeviceModeController::enter`].
///
/// Call [`ModeGuard::release`] to wait for the restore. Dropping an unreleased
/// guard schedules the restore on the current Tokio runtime instead.
#[must_use = "dropping the guard restores the prior mode immediately"]
pub struct ModeGuard {
    controller: DeviceModeController,
    restore_to: DeviceMode,
    armed: bool,
}

impl ModeGuard {
    /// Mode that will be restored
    pub fn restore_to(&self) -> DeviceMode {
        self.restore_to
    }

    /// Restore the prior mode and wait for the attempt to finish.
    ///
    /// The restore runs on its own task, so dropping this future part way
    /// does not abandon it.
    pub async fn release(mut self) {
        self.armed = false;
        let controller = self.controller.clone();
        let mode = self.restore_to;

        if let Err(e) = tokio::spawn(async move { controller.restore(mode).await }).await {
            warn!(%mode, error = %e, "Device mode restore task failed");
        }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let controller = self.controller.clone();
        let mode = self.restore_to;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { controller.restore(mode).await });
            }
            Err(_) => {
                metrics::counter!("qc.device.restore_failed").increment(1);
                warn!(%mode, "No runtime available, device mode not restored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVision;
    use crate::vision_client::MockVisionBackend;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_error_in_scope_restores_prior_mode_once() {
        let mut backend = MockVisionBackend::new();
        let mut seq = Sequence::new();
        backend
            .expect_set_mode()
            .with(eq(DeviceMode::Calibration))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        backend
            .expect_set_mode()
            .with(eq(DeviceMode::Raw))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let controller = DeviceModeController::new(Arc::new(backend));

        let result = controller
            .with_mode(DeviceMode::Calibration, || async {
                Err::<(), &str>("calibration target not found")
            })
            .await;

        assert_eq!(result.unwrap(), Err("calibration target not found"));
        assert_eq!(controller.current(), DeviceMode::Raw);
    }

    #[tokio::test]
    async fn test_failed_entry_skips_scope_and_restore() {
        let mut backend = MockVisionBackend::new();
        backend
            .expect_set_mode()
            .with(eq(DeviceMode::Measure))
            .times(1)
            .returning(|_| Err(VisionError::Timeout));

        let controller = DeviceModeController::new(Arc::new(backend));
        let calls = AtomicUsize::new(0);

        let result = controller
            .with_mode(DeviceMode::Measure, || async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(matches!(result, Err(VisionError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.current(), DeviceMode::Raw);
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_scope_result() {
        let mut backend = MockVisionBackend::new();
        backend
            .expect_set_mode()
            .with(eq(DeviceMode::Measure))
            .times(1)
            .returning(|_| Ok(()));
        backend
            .expect_set_mode()
            .with(eq(DeviceMode::Raw))
            .times(1)
            .returning(|_| {
                Err(VisionError::Api {
                    status: 500,
                    body: "camera offline".to_string(),
                })
            });

        let controller = DeviceModeController::new(Arc::new(backend));

        let result = controller
            .with_mode(DeviceMode::Measure, || async { 42 })
            .await;

        assert_eq!(result.unwrap(), 42);
        // The restore was not acknowledged, so the last requested mode stands
        assert_eq!(controller.current(), DeviceMode::Measure);
    }

    #[tokio::test]
    async fn test_cancelled_scope_still_restores() {
        let backend = Arc::new(FakeVision::new());
        let controller = DeviceModeController::new(backend.clone());

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            controller.with_mode(DeviceMode::Calibration, || {
                tokio::time::sleep(Duration::from_secs(60))
            }),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *backend.modes.lock(),
            vec![DeviceMode::Calibration, DeviceMode::Raw]
        );
        assert_eq!(controller.current(), DeviceMode::Raw);
    }

    #[tokio::test]
    async fn test_restores_to_previous_non_default_mode() {
        let backend = Arc::new(FakeVision::new());
        let controller = DeviceModeController::new(backend.clone());

        controller.set_mode(DeviceMode::Calibration).await.unwrap();

        let guard = controller.enter(DeviceMode::Measure).await.unwrap();
        assert_eq!(guard.restore_to(), DeviceMode::Calibration);
        assert_eq!(controller.current(), DeviceMode::Measure);

        guard.release().await;

        assert_eq!(
            *backend.modes.lock(),
            vec![
                DeviceMode::Calibration,
                DeviceMode::Measure,
                DeviceMode::Calibration
            ]
        );
        assert_eq!(controller.current(), DeviceMode::Calibration);
    }
}
