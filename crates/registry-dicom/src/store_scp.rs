//! 临时C-STORE接收端点
//!
//! C-MOVE的接收侧：在本地端口监听入站存储关联，剥除像素数据后
//! 将数据集经有界通道交回检索调用方。端点是作用域资源，
//! 随检索调用开启，在所有退出路径上关闭，绝不超出调用存活。

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dicom::dictionary_std::tags;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use tracing::{debug, warn};

use registry_core::{RegistryError, Result};

use crate::dimse;
use crate::dimse::command_field;

/// 有界通道容量；发送端在通道满时阻塞，构成背压
const DATASET_CHANNEL_CAPACITY: usize = 1024;
/// 接受循环的轮询间隔
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 运行中的临时接收端点
pub struct StoreScp {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    rx: Receiver<InMemDicomObject>,
}

impl StoreScp {
    /// 在 `bind_addr` 上开启接收端点
    pub fn start(bind_addr: &str, ae_title: &str, read_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let (tx, rx) = mpsc::sync_channel(DATASET_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_ae = ae_title.to_string();
        let handle = thread::Builder::new()
            .name("store-scp".to_string())
            .spawn(move || accept_loop(listener, thread_ae, tx, thread_shutdown, read_timeout))
            .map_err(|e| RegistryError::Internal(format!("无法启动接收线程: {e}")))?;

        debug!("临时C-STORE端点已开启: {}", bind_addr);
        Ok(Self {
            shutdown,
            handle: Some(handle),
            rx,
        })
    }

    /// 关闭端点并取回全部已接收的数据集
    pub fn finish(mut self) -> Vec<InMemDicomObject> {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut datasets = Vec::new();
        // 持续接收直至线程退出，避免发送端阻塞在有界通道上
        loop {
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(ds) => datasets.push(ds),
                Err(RecvTimeoutError::Timeout) => {
                    let finished = self
                        .handle
                        .as_ref()
                        .map(|h| h.is_finished())
                        .unwrap_or(true);
                    if finished {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        datasets.extend(self.rx.try_iter());
        debug!("临时C-STORE端点已关闭，共接收 {} 个数据集", datasets.len());
        datasets
    }
}

impl Drop for StoreScp {
    fn drop(&mut self) {
        // 兜底释放：即使调用方在错误路径上提前返回，端点也随之关闭
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    ae_title: String,
    tx: SyncSender<InMemDicomObject>,
    shutdown: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("接受入站存储关联: {}", peer);
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("无法切换流为阻塞模式: {}", e);
                    continue;
                }
                let _ = stream.set_read_timeout(Some(read_timeout));
                if let Err(e) = serve_association(stream, &ae_title, &tx) {
                    warn!("存储关联异常结束: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("接受入站连接失败: {}", e);
                break;
            }
        }
    }
}

/// 处理一个入站存储关联，接收其推送的全部数据集
fn serve_association(
    stream: TcpStream,
    ae_title: &str,
    tx: &SyncSender<InMemDicomObject>,
) -> Result<()> {
    let options = ServerAssociationOptions::new()
        .accept_any()
        .promiscuous(true)
        .ae_title(ae_title.to_string());
    let mut association = options
        .establish(stream)
        .map_err(|e| RegistryError::Association(format!("无法建立存储关联: {e}")))?;

    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut message_id: u16 = 1;
    let mut sop_class_uid = String::new();
    let mut sop_instance_uid = String::new();

    loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                for data_value in data {
                    match data_value.value_type {
                        PDataValueType::Data if !data_value.is_last => {
                            instance_buffer.extend_from_slice(&data_value.data);
                        }
                        PDataValueType::Data => {
                            instance_buffer.extend_from_slice(&data_value.data);
                            let ts_uid = association
                                .presentation_contexts()
                                .iter()
                                .find(|pc| pc.id == data_value.presentation_context_id)
                                .map(|pc| pc.transfer_syntax.clone())
                                .unwrap_or_default();
                            match TransferSyntaxRegistry.get(&ts_uid) {
                                Some(ts) => {
                                    match InMemDicomObject::read_dataset_with_ts(
                                        instance_buffer.as_slice(),
                                        ts,
                                    ) {
                                        Ok(mut obj) => {
                                            // 仅保留头部元数据，像素数据按设计丢弃
                                            obj.remove_element(tags::PIXEL_DATA);
                                            if tx.send(obj).is_err() {
                                                debug!("接收方已关闭，丢弃数据集");
                                            }
                                        }
                                        Err(e) => {
                                            warn!("无法解码推送的数据集: {}", e);
                                        }
                                    }
                                }
                                None => warn!("未知传输语法: {}", ts_uid),
                            }
                            instance_buffer.clear();

                            let rsp = dimse::store_response(
                                message_id,
                                &sop_class_uid,
                                &sop_instance_uid,
                            );
                            association
                                .send(&Pdu::PData {
                                    data: vec![PDataValue {
                                        presentation_context_id: data_value
                                            .presentation_context_id,
                                        value_type: PDataValueType::Command,
                                        is_last: true,
                                        data: dimse::encode_command(&rsp)?,
                                    }],
                                })
                                .map_err(|e| {
                                    RegistryError::Protocol(format!(
                                        "发送C-STORE响应失败: {e}"
                                    ))
                                })?;
                        }
                        PDataValueType::Command if data_value.is_last => {
                            let command = dimse::read_command(&data_value.data)?;
                            match command.command_field {
                                command_field::C_ECHO_RQ => {
                                    let rsp = dimse::echo_response(
                                        command.message_id.unwrap_or(1),
                                        command
                                            .affected_sop_class_uid
                                            .as_deref()
                                            .unwrap_or_default(),
                                    );
                                    association
                                        .send(&Pdu::PData {
                                            data: vec![PDataValue {
                                                presentation_context_id: data_value
                                                    .presentation_context_id,
                                                value_type: PDataValueType::Command,
                                                is_last: true,
                                                data: dimse::encode_command(&rsp)?,
                                            }],
                                        })
                                        .map_err(|e| {
                                            RegistryError::Protocol(format!(
                                                "发送C-ECHO响应失败: {e}"
                                            ))
                                        })?;
                                }
                                command_field::C_STORE_RQ => {
                                    message_id = command.message_id.unwrap_or(message_id);
                                    sop_class_uid =
                                        command.affected_sop_class_uid.unwrap_or_default();
                                    sop_instance_uid =
                                        command.affected_sop_instance_uid.unwrap_or_default();
                                }
                                other => {
                                    warn!("忽略不支持的命令: 0x{:04X}", other);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Pdu::ReleaseRQ) => {
                let _ = association.send(&Pdu::ReleaseRP);
                break;
            }
            Ok(Pdu::AbortRQ { .. }) => {
                debug!("存储关联被对端中止");
                break;
            }
            Ok(other) => {
                warn!("存储关联收到意外PDU: {:?}", other);
            }
            Err(e) => {
                return Err(RegistryError::Protocol(format!(
                    "接收存储数据失败: {e}"
                )));
            }
        }
    }
    Ok(())
}
