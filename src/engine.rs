//! Object transfer engine: the per-object select/create/stream/checkpoint/execute
//! sequence, with the retry and recovery policy from spec.

use crate::error::DfuError;
use crate::router::ControlPointRouter;
use crate::transport::DfuTransport;
use crate::wire::{ObjectType, Request, ResponseBody};

/// Number of attempts the init-packet and firmware phases make per object
/// before giving up.
const RETRIES_NUMBER: usize = 3;

fn crc32(buf: &[u8], init: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    hasher.update(buf);
    hasher.finalize()
}

/// Drives the select/create/stream/checkpoint/execute sequence for one
/// connected peripheral across all images of a package. Constructed once per
/// device; the transfer cursor is local to each `send_init_packet`/
/// `send_firmware` call and discarded afterwards.
pub struct ObjectTransferEngine<T> {
    router: ControlPointRouter<T>,
    prn: u16,
    progress: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl<T: DfuTransport> ObjectTransferEngine<T> {
    pub fn new(router: ControlPointRouter<T>, prn: u16) -> Self {
        Self {
            router,
            prn,
            progress: None,
        }
    }

    /// Attach a callback invoked with the cumulative firmware offset after
    /// each successfully completed data object. Used by the CLI to drive a
    /// progress bar; the engine itself only logs progress otherwise.
    pub fn with_progress_callback(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Configure packet receipt notifications for the session. A PRN of 0
    /// disables host-initiated checkpoints (the default).
    pub async fn configure_prn(&self) -> Result<(), DfuError> {
        self.router.request(Request::PrnSet { prn: self.prn }).await?;
        Ok(())
    }

    /// Negotiate the data-point fragment size via `MTU_GET`, clamping to
    /// whatever the peripheral reports. Never increases beyond that value.
    /// Best-effort: `MTU_GET` is optional per spec, so a peripheral that
    /// rejects it keeps the default `packet_size` rather than aborting.
    pub async fn negotiate_mtu(&self) -> Result<(), DfuError> {
        match self.router.request(Request::MtuGet).await {
            Ok(ResponseBody::Mtu { mtu }) => {
                let packet_size = (mtu as usize).saturating_sub(3).max(1);
                log::debug!("negotiated MTU={mtu}, packet_size={packet_size}");
                self.router.transport().set_packet_size(packet_size);
            }
            Ok(other) => {
                log::warn!("unexpected MTU_GET payload {other:?}, keeping default packet_size");
            }
            Err(DfuError::Device { .. } | DfuError::Protocol(_)) => {
                log::info!("peripheral does not support MTU_GET, keeping default packet_size");
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    async fn select(&self, object_type: ObjectType) -> Result<(u32, u32, u32), DfuError> {
        match self.router.request(Request::ObjectSelect { object_type }).await? {
            ResponseBody::Select { max_size, offset, crc } => {
                log::debug!(
                    "selected {object_type:?}: max_size={max_size} offset={offset} crc={crc:#010X}"
                );
                Ok((max_size, offset, crc))
            }
            other => Err(DfuError::Protocol(format!("unexpected SELECT payload: {other:?}"))),
        }
    }

    async fn create(&self, object_type: ObjectType, size: u32) -> Result<(), DfuError> {
        self.router.request(Request::ObjectCreate { object_type, size }).await?;
        log::debug!("created {object_type:?} object of {size} bytes");
        Ok(())
    }

    async fn execute(&self) -> Result<(), DfuError> {
        self.router.request(Request::ObjectExecute).await?;
        Ok(())
    }

    async fn crc_get(&self) -> Result<(u32, u32), DfuError> {
        match self.router.request(Request::CrcGet).await? {
            ResponseBody::Crc { offset, crc } => Ok((offset, crc)),
            other => Err(DfuError::Protocol(format!("unexpected CRC_GET payload: {other:?}"))),
        }
    }

    /// Checkpoint: ask the device for its `(offset, crc)` and compare against
    /// the host's view.
    async fn validate(&self, offset: u32, crc: u32) -> Result<(), DfuError> {
        let (device_offset, device_crc) = self.crc_get().await?;
        if device_offset != offset {
            return Err(DfuError::Validation(format!(
                "offset mismatch: host={offset} device={device_offset}"
            )));
        }
        if device_crc != crc {
            return Err(DfuError::Validation(format!(
                "crc mismatch: host={crc:#010X} device={device_crc:#010X}"
            )));
        }
        Ok(())
    }

    /// Stream `data` to the data-point characteristic starting at
    /// `(offset, crc)`, checkpointing every `prn` fragments (if `prn > 0`)
    /// and once more at the end. Returns the updated crc.
    async fn stream(&self, data: &[u8], mut offset: u32, mut crc: u32) -> Result<u32, DfuError> {
        let packet_size = self.router.transport().packet_size();
        let mut prn_counter: u16 = 0;
        for fragment in data.chunks(packet_size) {
            self.router.transport().write_data_point(fragment).await?;
            log::trace!("wrote {} bytes at offset {offset}", fragment.len());
            crc = crc32(fragment, crc);
            offset += fragment.len() as u32;
            prn_counter += 1;
            if self.prn > 0 && prn_counter == self.prn {
                prn_counter = 0;
                self.validate(offset, crc).await?;
            }
        }
        self.validate(offset, crc).await?;
        Ok(crc)
    }

    /// Attempt to resume a previously interrupted init-packet upload. Returns
    /// `true` if the phase is already complete.
    async fn try_recover_init(&self, init: &[u8], offset: u32, crc: u32) -> Result<bool, DfuError> {
        if offset == 0 || offset as usize > init.len() {
            return Ok(false);
        }
        if crc32(&init[..offset as usize], 0) != crc {
            return Ok(false);
        }
        if (offset as usize) < init.len() {
            match self.stream(&init[offset as usize..], offset, crc).await {
                Ok(_) => {}
                Err(DfuError::Validation(reason)) => {
                    log::warn!("init packet recovery checkpoint failed, falling back to fresh upload: {reason}");
                    return Ok(false);
                }
                Err(other) => return Err(other),
            }
        }
        self.execute().await?;
        Ok(true)
    }

    /// Send the init packet (the `COMMAND` object). Per spec: select, attempt
    /// recovery of a partial prior upload, otherwise create+stream+execute
    /// fresh, retrying the whole sequence on `ValidationError`.
    pub async fn send_init_packet(&self, init: &[u8]) -> Result<(), DfuError> {
        let (max_size, offset, crc) = self.select(ObjectType::Command).await?;
        if init.len() as u32 > max_size {
            return Err(DfuError::PackageTooLarge {
                size: init.len(),
                max_size: max_size as usize,
            });
        }

        if self.try_recover_init(init, offset, crc).await? {
            log::info!("init packet recovered at offset {offset}");
            return Ok(());
        }

        for attempt in 1..=RETRIES_NUMBER {
            log::debug!("init packet attempt {attempt}/{RETRIES_NUMBER}");
            match self.upload_init_once(init).await {
                Ok(()) => return Ok(()),
                Err(DfuError::Validation(reason)) => {
                    log::warn!("init packet validation failed, retrying from CREATE: {reason}");
                }
                Err(other) => return Err(other),
            }
        }
        Err(DfuError::InitPacketFailed)
    }

    async fn upload_init_once(&self, init: &[u8]) -> Result<(), DfuError> {
        self.create(ObjectType::Command, init.len() as u32).await?;
        self.stream(init, 0, 0).await?;
        self.execute().await
    }

    /// Recover the firmware transfer cursor from the device's reported
    /// `(offset, crc)`, rewinding to the last confirmed page boundary on a
    /// CRC mismatch. Returns the `(offset, crc)` the main loop should
    /// resume from.
    async fn recover_firmware(
        &self,
        firmware: &[u8],
        max_size: u32,
        mut offset: u32,
        mut crc: u32,
    ) -> Result<(u32, u32), DfuError> {
        if offset == 0 {
            return Ok((offset, crc));
        }

        let firmware_len = firmware.len() as u32;
        if offset > firmware_len {
            offset = firmware_len - (firmware_len % max_size);
            crc = crc32(&firmware[..offset as usize], 0);
            log::warn!("device offset beyond firmware length {firmware_len}, rewinding to {offset}");
            return Ok((offset, crc));
        }

        let expected = crc32(&firmware[..offset as usize], 0);
        let remainder = offset % max_size;
        if expected != crc {
            offset -= if remainder != 0 { remainder } else { max_size };
            crc = crc32(&firmware[..offset as usize], 0);
            log::warn!("firmware tail corrupted, rewinding to offset {offset}");
            return Ok((offset, crc));
        }

        if remainder != 0 && (offset as usize) < firmware.len() {
            let end = ((offset + max_size - remainder) as usize).min(firmware.len());
            let to_send = &firmware[offset as usize..end];
            match self.stream(to_send, offset, crc).await {
                Ok(new_crc) => {
                    offset += to_send.len() as u32;
                    crc = new_crc;
                    self.execute().await?;
                    log::info!("progress at {offset}");
                }
                Err(DfuError::Validation(reason)) => {
                    log::warn!("firmware recovery checkpoint failed, rewinding: {reason}");
                    offset -= remainder;
                    crc = crc32(&firmware[..offset as usize], 0);
                }
                Err(other) => return Err(other),
            }
        }

        Ok((offset, crc))
    }

    /// Send the firmware image (a sequence of `DATA` objects, each
    /// `min(max_size, remaining)` bytes).
    pub async fn send_firmware(&self, firmware: &[u8]) -> Result<(), DfuError> {
        let (max_size, offset, crc) = self.select(ObjectType::Data).await?;
        let (mut offset, mut crc) = self.recover_firmware(firmware, max_size, offset, crc).await?;

        let mut i = offset as usize;
        while i < firmware.len() {
            let end = (i + max_size as usize).min(firmware.len());
            let data = &firmware[i..end];

            let mut succeeded = false;
            for attempt in 1..=RETRIES_NUMBER {
                log::debug!("firmware object at offset {i} attempt {attempt}/{RETRIES_NUMBER}");
                match self.upload_data_object_once(data, i as u32, crc).await {
                    Ok(new_crc) => {
                        crc = new_crc;
                        succeeded = true;
                        break;
                    }
                    Err(DfuError::Validation(reason)) => {
                        log::warn!("firmware object validation failed, retrying from CREATE: {reason}");
                    }
                    Err(other) => return Err(other),
                }
            }
            if !succeeded {
                return Err(DfuError::FirmwareFailed);
            }

            offset = end as u32;
            i = end;
            log::info!("progress at {offset}");
            if let Some(callback) = &self.progress {
                callback(offset);
            }
        }
        Ok(())
    }

    async fn upload_data_object_once(&self, data: &[u8], offset: u32, crc: u32) -> Result<u32, DfuError> {
        self.create(ObjectType::Data, data.len() as u32).await?;
        let new_crc = self.stream(data, offset, crc).await?;
        self.execute().await?;
        Ok(new_crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NotificationHandler;
    use crate::wire::{OpCode, ResultCode};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockTransport {
        packet_size: AtomicUsize,
        responses: StdMutex<VecDeque<Vec<u8>>>,
        control_writes: StdMutex<Vec<Vec<u8>>>,
        data_writes: StdMutex<Vec<Vec<u8>>>,
        handler: StdMutex<Option<NotificationHandler>>,
    }

    impl MockTransport {
        fn new(packet_size: usize, responses: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                packet_size: AtomicUsize::new(packet_size),
                responses: StdMutex::new(responses.into()),
                control_writes: StdMutex::new(Vec::new()),
                data_writes: StdMutex::new(Vec::new()),
                handler: StdMutex::new(None),
            })
        }

        fn total_data_written(&self) -> usize {
            self.data_writes.lock().unwrap().iter().map(Vec::len).sum()
        }

        fn control_opcode_count(&self, opcode: OpCode) -> usize {
            let opcode: u8 = opcode.into();
            self.control_writes
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w[0] == opcode)
                .count()
        }
    }

    impl DfuTransport for MockTransport {
        async fn write_control_point(&self, bytes: &[u8]) -> Result<(), DfuError> {
            self.control_writes.lock().unwrap().push(bytes.to_vec());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted: unexpected control-point write");
            if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                handler(next);
            }
            Ok(())
        }

        async fn write_data_point(&self, bytes: &[u8]) -> Result<(), DfuError> {
            self.data_writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        async fn subscribe_control_point(&self, handler: NotificationHandler) -> Result<(), DfuError> {
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }

        fn packet_size(&self) -> usize {
            self.packet_size.load(Ordering::Relaxed)
        }

        fn set_packet_size(&self, size: usize) {
            self.packet_size.store(size, Ordering::Relaxed);
        }
    }

    fn ok(opcode: OpCode) -> Vec<u8> {
        vec![0x60, opcode.into(), ResultCode::Success.into()]
    }

    fn select_ok(max_size: u32, offset: u32, crc: u32) -> Vec<u8> {
        let mut v = ok(OpCode::ObjectSelect);
        v.extend_from_slice(&max_size.to_le_bytes());
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&crc.to_le_bytes());
        v
    }

    fn crc_ok(offset: u32, crc: u32) -> Vec<u8> {
        let mut v = ok(OpCode::CrcGet);
        v.extend_from_slice(&offset.to_le_bytes());
        v.extend_from_slice(&crc.to_le_bytes());
        v
    }

    async fn engine(transport: Arc<MockTransport>, prn: u16) -> ObjectTransferEngine<MockTransport> {
        let router = ControlPointRouter::new(transport, Duration::from_millis(500))
            .await
            .unwrap();
        ObjectTransferEngine::new(router, prn)
    }

    #[tokio::test]
    async fn s1_happy_path_init() {
        let init: Vec<u8> = (0..123u32).map(|i| i as u8).collect();
        let full_crc = crc32(&init, 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(256, 0, 0),
                ok(OpCode::ObjectCreate),
                crc_ok(123, full_crc),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_init_packet(&init).await.unwrap();

        assert_eq!(transport.control_opcode_count(OpCode::ObjectCreate), 1);
        assert_eq!(transport.total_data_written(), 123);
        assert_eq!(transport.data_writes.lock().unwrap().len(), 7); // 6*20 + 1*3
    }

    #[tokio::test]
    async fn s2_init_resume() {
        let init: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let prefix_crc = crc32(&init[..50], 0);
        let full_crc = crc32(&init, 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(256, 50, prefix_crc),
                crc_ok(100, full_crc),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_init_packet(&init).await.unwrap();

        assert_eq!(transport.control_opcode_count(OpCode::ObjectCreate), 0);
        assert_eq!(transport.total_data_written(), 50);
    }

    #[tokio::test]
    async fn s3_init_mismatched_crc_triggers_full_reupload() {
        let init: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let full_crc = crc32(&init, 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(256, 50, 0xdead_beef),
                ok(OpCode::ObjectCreate),
                crc_ok(100, full_crc),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_init_packet(&init).await.unwrap();

        assert_eq!(transport.control_opcode_count(OpCode::ObjectCreate), 1);
        let create = transport.control_writes.lock().unwrap()[1].clone();
        assert_eq!(&create[2..6], &100u32.to_le_bytes());
        assert_eq!(transport.total_data_written(), 100);
    }

    #[tokio::test]
    async fn s4_firmware_rewind_to_page_boundary() {
        let firmware: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let max_size = 4096u32;
        let second_page_crc = crc32(&firmware[..8192], 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(max_size, 5000, 0xdead_beef),
                ok(OpCode::ObjectCreate),
                crc_ok(8192, second_page_crc),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_firmware(&firmware).await.unwrap();

        let create = transport.control_writes.lock().unwrap()[1].clone();
        assert_eq!(&create[2..6], &4096u32.to_le_bytes());
        assert_eq!(transport.total_data_written(), 4096);
    }

    #[tokio::test]
    async fn s5_prn_checkpoint_failure_retries_create() {
        let firmware: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let prefix4_crc = crc32(&firmware[..80], 0);
        let full_crc = crc32(&firmware, 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(100, 0, 0),
                ok(OpCode::ObjectCreate),   // attempt 1 create
                crc_ok(80, 0xbadc_0ffe),    // 4th-fragment checkpoint: wrong crc
                ok(OpCode::ObjectCreate),   // attempt 2 create
                crc_ok(80, prefix4_crc),    // 4th-fragment checkpoint: matches
                crc_ok(100, full_crc),      // final checkpoint
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 4).await;
        engine.send_firmware(&firmware).await.unwrap();

        assert_eq!(transport.control_opcode_count(OpCode::ObjectCreate), 2);
    }

    #[tokio::test]
    async fn s6_ext_error_surfaces_as_device_error() {
        let transport = MockTransport::new(
            20,
            vec![vec![
                0x60,
                OpCode::ObjectSelect.into(),
                ResultCode::ExtError.into(),
                crate::error::ExtError::VerificationFailed.into(),
            ]],
        );
        let engine = engine(transport.clone(), 0).await;
        let err = engine.send_init_packet(&[1, 2, 3]).await.unwrap_err();
        match err {
            DfuError::Device { code, ext } => {
                assert_eq!(code, ResultCode::ExtError);
                assert_eq!(ext, Some(crate::error::ExtError::VerificationFailed));
            }
            other => panic!("expected Device error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn init_packet_too_large_aborts_before_any_write() {
        let transport = MockTransport::new(20, vec![select_ok(10, 0, 0)]);
        let engine = engine(transport.clone(), 0).await;
        let err = engine.send_init_packet(&[0u8; 20]).await.unwrap_err();
        assert!(matches!(err, DfuError::PackageTooLarge { size: 20, max_size: 10 }));
        assert_eq!(transport.total_data_written(), 0);
    }

    #[tokio::test]
    async fn firmware_offset_beyond_length_rewinds_instead_of_panicking() {
        let firmware: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let full_crc = crc32(&firmware, 0);
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(4096, 5000, 0xdead_beef), // stale device offset past firmware.len()
                ok(OpCode::ObjectCreate),
                crc_ok(100, full_crc),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_firmware(&firmware).await.unwrap();

        assert_eq!(transport.control_opcode_count(OpCode::ObjectCreate), 1);
        assert_eq!(transport.total_data_written(), 100);
    }

    #[tokio::test]
    async fn negotiate_mtu_falls_back_to_default_when_unsupported() {
        let transport = MockTransport::new(
            20,
            vec![vec![0x60, OpCode::MtuGet.into(), ResultCode::OpCodeNotSupported.into()]],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.negotiate_mtu().await.unwrap();
        assert_eq!(transport.packet_size(), 20);
    }

    #[tokio::test]
    async fn firmware_offset_equals_length_on_success() {
        let firmware: Vec<u8> = (0..50u32).map(|i| i as u8).collect();
        let transport = MockTransport::new(
            20,
            vec![
                select_ok(4096, 0, 0),
                ok(OpCode::ObjectCreate),
                crc_ok(50, crc32(&firmware, 0)),
                ok(OpCode::ObjectExecute),
            ],
        );
        let engine = engine(transport.clone(), 0).await;
        engine.send_firmware(&firmware).await.unwrap();
        assert_eq!(transport.total_data_written(), firmware.len());
    }
}
