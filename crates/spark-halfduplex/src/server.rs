//! # 半双工服务端：把上传、下载两条物理连接重新拼成一条 main line
//!
//! ## 核心意图（Why）
//! - 客户端把一条双向逻辑连接拆成两条物理连接，各自以 8 字节关联头开场；
//! - 服务端按关联 id 配对两半，配对成功后合成一条 main line 交给上游，
//!   上游看到的就是一条普通的双向连接。
//!
//! ## 状态机（How）
//! - 物理连接：`Unknown` → `UploadPending`/`DownloadPending` → `UploadDirect`/`DownloadDirect`，
//!   或在读到头部时直接进入 `*Direct`；
//! - 两半落在不同工作线程时，上传一侧经 Pipe-Line 移交到下载所在线程：
//!   上传后到时直接移交；下载后到时登记并向上传所在线程投递 [`PairingCommand::RecheckPairing`]；
//! - 配对后的三条 Line 归入同一个组（[`GroupArena`]），任一条结束都经由同一个拆除函数，
//!   另外两条各收到恰好一次 `Fin`。
//!
//! ## 契约（What）
//! - main line 由本 stage 创建与销毁；物理连接由传输层在收到下行 `Fin` 后销毁；
//! - 配对前缓存的负载以 `first` 标记作为 main line 的首条负载恰好上送一次，头部已剥离；
//! - 待配对上传缓存超过 `max_buffering` 时清空缓存，连接保持等待。

use std::sync::{Arc, Weak};

use spark_buffer::PooledBuffer;
use spark_tunnel::{
    Context, FlowControl, Hop, Line, Message, Runtime, Tunnel, WorkerId,
};
use tracing::{debug, trace, warn};

use crate::{
    config::HalfDuplexServerConfig,
    error::HalfDuplexError,
    group::{GroupArena, GroupKey},
    header::{CorrelationHeader, Direction, HEADER_LEN},
    table::{Arrival, PairingTables, Recheck},
};

/// 投递到上传所在线程的配对命令。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingCommand {
    /// 下载已在其它线程登记，检查本线程上等待的上传是否应当移交过去。
    RecheckPairing { hash: u64 },
}

struct ServerGroup {
    upload: Line,
    download: Line,
    main: Line,
    first_sent: bool,
}

/// 物理连接上的 chain state。
enum ServerState {
    Unknown {
        buffering: Option<PooledBuffer>,
    },
    UploadPending {
        hash: u64,
        buffering: Option<PooledBuffer>,
    },
    DownloadPending {
        hash: u64,
    },
    UploadDirect {
        group: GroupKey,
    },
    DownloadDirect {
        group: GroupKey,
    },
}

impl ServerState {
    fn name(&self) -> &'static str {
        match self {
            Self::Unknown { .. } => "unknown",
            Self::UploadPending { .. } => "upload-pending",
            Self::DownloadPending { .. } => "download-pending",
            Self::UploadDirect { .. } => "upload-direct",
            Self::DownloadDirect { .. } => "download-direct",
        }
    }
}

/// main line 上的 chain state。
struct MainState {
    group: GroupKey,
}

pub struct HalfDuplexServer {
    me: Weak<Self>,
    config: HalfDuplexServerConfig,
    tables: PairingTables,
    groups: GroupArena<ServerGroup>,
}

impl HalfDuplexServer {
    pub fn new(
        runtime: &Runtime,
        config: HalfDuplexServerConfig,
    ) -> Result<Arc<Self>, HalfDuplexError> {
        config.validate()?;
        let shards = config.shards_for(runtime.workers());
        let workers = runtime.workers();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            tables: PairingTables::new(shards),
            groups: GroupArena::new(workers),
        }))
    }

    pub fn config(&self) -> &HalfDuplexServerConfig {
        &self.config
    }

    pub fn tables(&self) -> &PairingTables {
        &self.tables
    }

    /// 已配对、尚未拆除的逻辑连接数。
    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }

    /// 执行投递到当前线程的配对命令。
    pub fn execute(&self, hop: &Hop<'_>, worker: WorkerId, command: PairingCommand) {
        match command {
            PairingCommand::RecheckPairing { hash } => self.recheck(hop, worker, hash),
        }
    }

    fn on_init(&self, hop: &Hop<'_>, line: Line) {
        line.set_state(hop.index(), ServerState::Unknown { buffering: None });
        // 管道目标端的 Est 已由发起端回应过。
        if !line.is_down_piped() {
            hop.next_down(Context::est(line));
        }
    }

    fn on_payload(&self, hop: &Hop<'_>, line: Line, buffer: PooledBuffer) {
        let index = hop.index();
        let Some(state) = line.take_state::<ServerState>(index) else {
            debug!(line = line.id(), "payload on a line without half-duplex state; dropped");
            return;
        };
        match state {
            ServerState::Unknown { buffering } => {
                let buffer = merge(buffering, buffer);
                match CorrelationHeader::decode(&buffer) {
                    Ok(header) => match header.direction {
                        Direction::Upload => self.upload_arrived(hop, line, header.hash, buffer),
                        Direction::Download => {
                            self.download_arrived(hop, line, header.hash, buffer)
                        }
                    },
                    Err(_) => line.set_state(
                        index,
                        ServerState::Unknown {
                            buffering: Some(buffer),
                        },
                    ),
                }
            }
            ServerState::UploadPending { hash, buffering } => {
                let buffering = self.capped(&line, hash, merge(buffering, buffer));
                line.set_state(index, ServerState::UploadPending { hash, buffering });
            }
            ServerState::UploadDirect { group } => {
                line.set_state(index, ServerState::UploadDirect { group });
                let (main, first) = self.groups.with(group, |group| {
                    let first = !group.first_sent;
                    group.first_sent = true;
                    (group.main.clone(), first)
                });
                let ctx = Context::payload(main, buffer);
                hop.next_up(if first { ctx.with_first() } else { ctx });
            }
            state @ (ServerState::DownloadPending { .. } | ServerState::DownloadDirect { .. }) => {
                trace!(
                    line = line.id(),
                    state = state.name(),
                    len = buffer.len(),
                    "payload on a download connection dropped"
                );
                line.set_state(index, state);
            }
        }
    }

    fn upload_arrived(&self, hop: &Hop<'_>, line: Line, hash: u64, mut buffer: PooledBuffer) {
        match self.tables.arrive_upload(hash, &line) {
            Arrival::Pending => {
                buffer.advance(HEADER_LEN);
                let buffering = self.capped(&line, hash, buffer);
                debug!(line = line.id(), worker = line.worker(), hash, "upload waiting for its download");
                line.set_state(hop.index(), ServerState::UploadPending { hash, buffering });
            }
            Arrival::Duplicate => self.reject_duplicate(hop, line, hash, Direction::Upload),
            Arrival::PeerElsewhere { worker } => self.hand_off(hop, &line, hash, worker, buffer),
            Arrival::Paired(download) => {
                match download.take_state::<ServerState>(hop.index()) {
                    Some(ServerState::DownloadPending { .. }) => {}
                    other => panic!(
                        "paired download line {} is in state {}",
                        download.id(),
                        other.as_ref().map_or("none", ServerState::name)
                    ),
                }
                buffer.advance(HEADER_LEN);
                self.pair(hop, line, download, hash, non_empty(buffer));
            }
            Arrival::UploadElsewhere { .. } => {
                panic!("upload arrival {hash:#x} answered with a download-only outcome")
            }
        }
    }

    fn download_arrived(&self, hop: &Hop<'_>, line: Line, hash: u64, buffer: PooledBuffer) {
        if buffer.len() > HEADER_LEN {
            trace!(line = line.id(), len = buffer.len() - HEADER_LEN, "bytes after download header dropped");
        }
        drop(buffer);
        let index = hop.index();
        match self.tables.arrive_download(hash, &line) {
            Arrival::Pending => {
                debug!(line = line.id(), worker = line.worker(), hash, "download waiting for its upload");
                line.set_state(index, ServerState::DownloadPending { hash });
            }
            Arrival::Duplicate => self.reject_duplicate(hop, line, hash, Direction::Download),
            Arrival::UploadElsewhere { worker } => {
                debug!(
                    line = line.id(),
                    worker = line.worker(),
                    upload_worker = worker,
                    hash,
                    "download waiting; upload lives on another worker"
                );
                line.set_state(index, ServerState::DownloadPending { hash });
                self.post_recheck(hop, worker, hash);
            }
            Arrival::Paired(upload) => {
                let buffering = match upload.take_state::<ServerState>(index) {
                    Some(ServerState::UploadPending { buffering, .. }) => buffering,
                    other => panic!(
                        "paired upload line {} is in state {}",
                        upload.id(),
                        other.as_ref().map_or("none", ServerState::name)
                    ),
                };
                self.pair(hop, upload, line, hash, buffering);
            }
            Arrival::PeerElsewhere { .. } => {
                panic!("download arrival {hash:#x} answered with an upload-only outcome")
            }
        }
    }

    fn reject_duplicate(&self, hop: &Hop<'_>, line: Line, hash: u64, direction: Direction) {
        warn!(
            line = line.id(),
            worker = line.worker(),
            hash,
            ?direction,
            "duplicate correlation id; closing the new connection"
        );
        hop.send_down(Context::fin(line));
    }

    fn post_recheck(&self, hop: &Hop<'_>, worker: WorkerId, hash: u64) {
        let Some(server) = self.me.upgrade() else {
            return;
        };
        let stage = hop.handle();
        let command = PairingCommand::RecheckPairing { hash };
        let posted = hop.post(
            worker,
            Box::new(move || server.execute(&stage.hop(), worker, command)),
        );
        if let Err(err) = posted {
            warn!(worker, hash, error = %err, "recheck notification dropped");
        }
    }

    fn recheck(&self, hop: &Hop<'_>, worker: WorkerId, hash: u64) {
        match self.tables.recheck(hash, worker) {
            Recheck::Stale => debug!(worker, hash, "recheck found no upload to hand off"),
            Recheck::Orphaned(upload) => {
                self.take_pending_upload(hop, &upload);
                debug!(line = upload.id(), hash, "download vanished before recheck; closing upload");
                hop.send_down(Context::fin(upload));
            }
            Recheck::Handoff {
                upload,
                download_worker,
            } => {
                let mut buffer = self
                    .take_pending_upload(hop, &upload)
                    .unwrap_or_else(|| hop.pool(upload.worker()).acquire_with(HEADER_LEN));
                buffer.prepend(&CorrelationHeader::new(Direction::Upload, hash).encode());
                self.hand_off(hop, &upload, hash, download_worker, buffer);
            }
        }
    }

    fn take_pending_upload(&self, hop: &Hop<'_>, upload: &Line) -> Option<PooledBuffer> {
        match upload.take_state::<ServerState>(hop.index()) {
            Some(ServerState::UploadPending { buffering, .. }) => buffering,
            other => panic!(
                "rechecked upload line {} is in state {}",
                upload.id(),
                other.as_ref().map_or("none", ServerState::name)
            ),
        }
    }

    /// 把上传连接（含关联头）移交给 `target` 线程上的本 stage 重新配对。
    fn hand_off(
        &self,
        hop: &Hop<'_>,
        line: &Line,
        hash: u64,
        target: WorkerId,
        buffer: PooledBuffer,
    ) {
        if line.pipe_end().is_some() {
            debug!(line = line.id(), hash, to = target, "piped upload met its download on yet another worker; closing");
            hop.send_down(Context::fin(line.clone()));
            return;
        }
        if let Err(err) = hop.pipe_to(line, target) {
            warn!(line = line.id(), hash, to = target, error = %err, "upload hand-off failed; closing");
            hop.send_down(Context::fin(line.clone()));
            return;
        }
        debug!(line = line.id(), hash, from = line.worker(), to = target, "upload handed off to its download's worker");
        hop.reenter_up(Context::payload(line.clone(), buffer));
    }

    fn capped(&self, line: &Line, hash: u64, buffer: PooledBuffer) -> Option<PooledBuffer> {
        if buffer.len() > self.config.max_buffering {
            warn!(
                line = line.id(),
                hash,
                len = buffer.len(),
                limit = self.config.max_buffering,
                "pending upload exceeded the buffering limit; buffered bytes dropped"
            );
            return None;
        }
        non_empty(buffer)
    }

    fn pair(
        &self,
        hop: &Hop<'_>,
        upload: Line,
        download: Line,
        hash: u64,
        buffering: Option<PooledBuffer>,
    ) {
        let index = hop.index();
        let worker = download.worker();
        let main = Line::new(worker);
        let group = self.groups.insert(
            worker,
            ServerGroup {
                upload: upload.clone(),
                download: download.clone(),
                main: main.clone(),
                first_sent: false,
            },
        );
        upload.set_state(index, ServerState::UploadDirect { group });
        download.set_state(index, ServerState::DownloadDirect { group });
        main.set_state(index, MainState { group });

        let half_flow: Arc<dyn FlowControl> = Arc::new(HalfFlow { main: main.clone() });
        upload.setup_up_side(half_flow.clone());
        download.setup_up_side(half_flow);
        main.setup_down_side(Arc::new(MainFlow {
            upload: upload.clone(),
            download: download.clone(),
        }));
        debug!(
            hash,
            worker,
            upload = upload.id(),
            download = download.id(),
            main = main.id(),
            "half-duplex pair established"
        );

        let _pin = main.lock();
        hop.next_up(Context::init(main.clone()));
        if !main.is_alive() {
            debug!(main = main.id(), hash, "upstream rejected the main line");
            return;
        }
        if let Some(buffer) = buffering {
            self.groups.with(group, |group| group.first_sent = true);
            hop.next_up(Context::payload(main.clone(), buffer).with_first());
        }
    }

    fn on_fin(&self, hop: &Hop<'_>, line: Line) {
        let Some(state) = line.take_state::<ServerState>(hop.index()) else {
            trace!(line = line.id(), "fin on a line without half-duplex state");
            return;
        };
        match state {
            ServerState::Unknown { .. } => {
                trace!(line = line.id(), "connection closed before its header");
            }
            ServerState::UploadPending { hash, .. } => {
                self.tables.remove_upload(hash, &line);
                debug!(line = line.id(), hash, "pending upload closed");
            }
            ServerState::DownloadPending { hash } => {
                self.tables.remove_download(hash, &line);
                debug!(line = line.id(), hash, "pending download closed");
            }
            ServerState::UploadDirect { group } | ServerState::DownloadDirect { group } => {
                self.close_from_half(hop, group, &line);
            }
        }
    }

    /// 物理连接之一结束：结束 main line 并关闭另一半。
    fn close_from_half(&self, hop: &Hop<'_>, key: GroupKey, closer: &Line) {
        let index = hop.index();
        let ServerGroup {
            upload,
            download,
            main,
            ..
        } = self.groups.dissolve(key);
        let other = if *closer == upload { download.clone() } else { upload.clone() };
        expect_direct(&other, other.take_state::<ServerState>(index));
        assert!(
            main.take_state::<MainState>(index).is_some(),
            "main line {} lost its state before teardown",
            main.id()
        );

        upload.done_up_side();
        download.done_up_side();
        main.done_down_side();
        debug!(closer = closer.id(), main = main.id(), "half-duplex pair closed by a physical connection");

        hop.next_up(Context::fin(main.clone()));
        main.destroy();
        hop.send_down(Context::fin(other));
    }

    /// 上游结束 main line：关闭两条物理连接。
    fn close_from_main(&self, hop: &Hop<'_>, key: GroupKey, main: &Line) {
        let index = hop.index();
        main.take_state::<MainState>(index);
        let ServerGroup {
            upload, download, ..
        } = self.groups.dissolve(key);
        for half in [&upload, &download] {
            expect_direct(half, half.take_state::<ServerState>(index));
            half.done_up_side();
        }
        main.done_down_side();
        main.destroy();
        debug!(main = main.id(), "half-duplex pair closed from upstream");

        hop.send_down(Context::fin(upload));
        hop.send_down(Context::fin(download));
    }
}

impl Tunnel for HalfDuplexServer {
    fn name(&self) -> &'static str {
        "halfduplex-server"
    }

    fn up_stream(&self, hop: &Hop<'_>, ctx: Context) {
        let Some(ctx) = hop.route_up_pipe(ctx) else {
            return;
        };
        let Context { line, message, .. } = ctx;
        match message {
            Message::Init => self.on_init(hop, line),
            Message::Payload(buffer) => self.on_payload(hop, line, buffer),
            Message::Est => trace!(line = line.id(), "est from below ignored"),
            Message::Fin => self.on_fin(hop, line),
        }
    }

    fn down_stream(&self, hop: &Hop<'_>, ctx: Context) {
        let main = ctx.line.clone();
        let Some(group) = main.with_state(hop.index(), |state: &mut MainState| state.group) else {
            trace!(line = main.id(), kind = ctx.kind(), "context for a closed main line dropped");
            return;
        };
        match &ctx.message {
            Message::Payload(_) => {
                let download = self.groups.with(group, |group| group.download.clone());
                hop.send_down(ctx.switch_line(download));
            }
            Message::Est => trace!(line = main.id(), "est on main line consumed"),
            Message::Init => warn!(line = main.id(), "init from above on a main line ignored"),
            Message::Fin => self.close_from_main(hop, group, &main),
        }
    }
}

fn expect_direct(line: &Line, state: Option<ServerState>) {
    match state {
        Some(ServerState::UploadDirect { .. } | ServerState::DownloadDirect { .. }) => {}
        other => panic!(
            "paired line {} is in state {}",
            line.id(),
            other.as_ref().map_or("none", ServerState::name)
        ),
    }
}

fn merge(pending: Option<PooledBuffer>, buffer: PooledBuffer) -> PooledBuffer {
    match pending {
        Some(mut pending) => {
            pending.append(buffer);
            pending
        }
        None => buffer,
    }
}

fn non_empty(buffer: PooledBuffer) -> Option<PooledBuffer> {
    (!buffer.is_empty()).then_some(buffer)
}

/// 物理连接上侧的流控：暂停 main line 的上侧。
struct HalfFlow {
    main: Line,
}

impl FlowControl for HalfFlow {
    fn pause(&self) {
        self.main.pause_up_side();
    }

    fn resume(&self) {
        self.main.resume_up_side();
    }
}

/// main line 下侧的流控：同时暂停两条物理连接的下侧。
struct MainFlow {
    upload: Line,
    download: Line,
}

impl FlowControl for MainFlow {
    fn pause(&self) {
        self.upload.pause_down_side();
        self.download.pause_down_side();
    }

    fn resume(&self) {
        self.upload.resume_down_side();
        self.download.resume_down_side();
    }
}
