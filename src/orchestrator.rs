//! Upgrade orchestrator: iterate a package's images, driving the init-packet
//! then firmware phases for each. Any fatal error aborts the whole package.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use crate::engine::ObjectTransferEngine;
use crate::error::DfuError;
use crate::package::{Package, Role};
use crate::router::ControlPointRouter;
use crate::transport::DfuTransport;

/// Timing for one completed image, for progress reporting.
pub struct ImageReport {
    pub role: Role,
    pub elapsed: Duration,
}

/// Invoked with `(role, bytes sent so far in this image's firmware, total
/// firmware bytes for this image)` after each completed data object.
pub type ProgressCallback = Arc<dyn Fn(Role, u32, usize) + Send + Sync>;

/// Drive init-packet then firmware phases for every image in `package`, in
/// its canonical order. The engine is constructed once and lives across all
/// images of the package, per the engine's lifecycle.
pub async fn upgrade<T: DfuTransport>(
    router: ControlPointRouter<T>,
    package: &Package,
    prn: u16,
    on_progress: Option<ProgressCallback>,
) -> Result<Vec<ImageReport>, DfuError> {
    // (current role, total firmware bytes for that role) -- read by the
    // engine's progress callback, which only knows the in-image byte offset.
    let current: Arc<StdMutex<(Role, usize)>> = Arc::new(StdMutex::new((Role::Application, 0)));

    let mut engine = ObjectTransferEngine::new(router, prn);
    if let Some(callback) = on_progress {
        let current = current.clone();
        engine = engine.with_progress_callback(move |offset| {
            let (role, total) = *current.lock().unwrap();
            callback(role, offset, total);
        });
    }
    engine.configure_prn().await?;
    engine.negotiate_mtu().await?;

    let mut reports = Vec::with_capacity(package.images.len());
    for image in &package.images {
        let started = Instant::now();
        *current.lock().unwrap() = (image.role, image.firmware.len());

        log::info!("sending init packet for {:?}...", image.role);
        engine.send_init_packet(&image.init_packet).await?;
        log::info!("sending firmware for {:?}...", image.role);
        engine.send_firmware(&image.firmware).await?;

        let elapsed = started.elapsed();
        log::info!("image {:?} sent in {:.2}s", image.role, elapsed.as_secs_f32());
        reports.push(ImageReport {
            role: image.role,
            elapsed,
        });
    }
    Ok(reports)
}
