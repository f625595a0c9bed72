//! # 半双工客户端：一条逻辑连接拆成上传与下载两条物理连接
//!
//! ## 核心意图（Why）
//! - 下方传输层交上来的每条连接（main line）都在上游侧对应两条新建的 Line：
//!   上传承载客户端到服务端的全部负载，下载承载服务端到客户端的回包；
//! - 服务端依靠两条连接开头的 8 字节关联头把它们重新配对。
//!
//! ## 逻辑（How）
//! - `Init`：依次在上传、下载上向上游发起 `Init`，每次都钉住对应 Line 以检查存活；
//!   任一侧被拒绝时，拒绝方的 `Fin` 经 [`Tunnel::down_stream`] 拆除整组；
//! - 首条负载：生成 63 位随机 id，先在下载上发送下载方向的头部，
//!   再把上传方向的头部前插到负载前随上传发出；此后的负载原样走上传；
//! - 下行：两半的负载都回到 main line，只有下载的 `Est` 被转交。
//!
//! ## 契约（What）
//! - 上传、下载由本 stage 创建与销毁；main line 由传输层在收到下行 `Fin` 后销毁；
//! - 三条 Line 上挂同一类状态 [`ClientLink`]，指向同一个组，拆除时一次性清空。

use std::sync::Arc;

use spark_buffer::PooledBuffer;
use spark_tunnel::{Context, FlowControl, Hop, Line, Message, Runtime, Tunnel};
use tracing::{debug, trace, warn};

use crate::{
    group::{GroupArena, GroupKey},
    header::{CorrelationHeader, Direction, random_hash},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Main,
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug)]
struct ClientLink {
    group: GroupKey,
    role: Role,
}

struct ClientGroup {
    main: Line,
    upload: Line,
    download: Line,
    upload_ready: bool,
    download_ready: bool,
    handshake_sent: bool,
}

pub struct HalfDuplexClient {
    groups: GroupArena<ClientGroup>,
}

impl HalfDuplexClient {
    pub fn new(runtime: &Runtime) -> Arc<Self> {
        Arc::new(Self {
            groups: GroupArena::new(runtime.workers()),
        })
    }

    /// 尚未拆除的逻辑连接数。
    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }

    fn link(hop: &Hop<'_>, line: &Line) -> Option<ClientLink> {
        line.with_state(hop.index(), |link: &mut ClientLink| *link)
    }

    fn open(&self, hop: &Hop<'_>, main: Line) {
        let index = hop.index();
        let worker = main.worker();
        let upload = Line::new(worker);
        let download = Line::new(worker);
        let group = self.groups.insert(
            worker,
            ClientGroup {
                main: main.clone(),
                upload: upload.clone(),
                download: download.clone(),
                upload_ready: false,
                download_ready: false,
                handshake_sent: false,
            },
        );
        for (line, role) in [
            (&main, Role::Main),
            (&upload, Role::Upload),
            (&download, Role::Download),
        ] {
            line.set_state(index, ClientLink { group, role });
        }

        {
            let _pin = upload.lock();
            hop.next_up(Context::init(upload.clone()));
            if !upload.is_alive() {
                debug!(main = main.id(), "upstream rejected the upload half");
                return;
            }
        }
        self.groups.with(group, |group| group.upload_ready = true);

        {
            let _pin = download.lock();
            hop.next_up(Context::init(download.clone()));
            if !download.is_alive() {
                debug!(main = main.id(), "upstream rejected the download half");
                return;
            }
        }
        self.groups.with(group, |group| group.download_ready = true);

        main.setup_up_side(Arc::new(MainFlow {
            upload: upload.clone(),
            download: download.clone(),
        }));
        let half_flow: Arc<dyn FlowControl> = Arc::new(HalfFlow { main: main.clone() });
        upload.setup_down_side(half_flow.clone());
        download.setup_down_side(half_flow);
        trace!(
            main = main.id(),
            upload = upload.id(),
            download = download.id(),
            "half-duplex halves opened"
        );
    }

    fn send(&self, hop: &Hop<'_>, main: Line, mut buffer: PooledBuffer) {
        let Some(link) = Self::link(hop, &main) else {
            trace!(line = main.id(), "payload for a closed logical connection dropped");
            return;
        };
        let (upload, download, handshake) = self.groups.with(link.group, |group| {
            let handshake = !group.handshake_sent;
            group.handshake_sent = true;
            (group.upload.clone(), group.download.clone(), handshake)
        });
        if !handshake {
            hop.next_up(Context::payload(upload, buffer));
            return;
        }

        let hash = random_hash();
        debug!(main = main.id(), hash, "half-duplex handshake");
        let intro = hop
            .pool(main.worker())
            .copy_from_slice(&CorrelationHeader::new(Direction::Download, hash).encode());
        let _pin = main.lock();
        hop.next_up(Context::payload(download, intro).with_first());
        if !main.is_alive() {
            return;
        }
        buffer.prepend(&CorrelationHeader::new(Direction::Upload, hash).encode());
        hop.next_up(Context::payload(upload, buffer).with_first());
    }

    /// 传输层结束 main line：向上游结束两半并销毁它们。
    fn close_from_main(&self, hop: &Hop<'_>, main: &Line) {
        let Some(link) = Self::link(hop, main) else {
            trace!(line = main.id(), "fin for a closed logical connection");
            return;
        };
        let group = self.release(hop, link.group);
        debug!(main = main.id(), "logical connection closed from below");
        if group.upload_ready {
            hop.next_up(Context::fin(group.upload.clone()));
        }
        if group.download_ready {
            hop.next_up(Context::fin(group.download.clone()));
        }
        group.upload.destroy();
        group.download.destroy();
    }

    /// 上游结束了其中一半：关闭另一半、销毁两半并结束 main line。
    fn close_from_half(&self, hop: &Hop<'_>, link: ClientLink, closer: &Line) {
        let group = self.release(hop, link.group);
        debug!(
            main = group.main.id(),
            closer = closer.id(),
            role = ?link.role,
            "logical connection closed from above"
        );
        let (other, other_ready) = match link.role {
            Role::Upload => (&group.download, group.download_ready),
            Role::Download => (&group.upload, group.upload_ready),
            Role::Main => panic!("main line {} closed as a half", closer.id()),
        };
        if other_ready {
            hop.next_up(Context::fin(other.clone()));
        }
        group.upload.destroy();
        group.download.destroy();
        hop.next_down(Context::fin(group.main));
    }

    /// 拆除组：清空三条 Line 上的状态并注销流控。
    fn release(&self, hop: &Hop<'_>, key: GroupKey) -> ClientGroup {
        let group = self.groups.dissolve(key);
        let index = hop.index();
        for line in [&group.main, &group.upload, &group.download] {
            line.take_state::<ClientLink>(index);
        }
        group.main.done_up_side();
        group.upload.done_down_side();
        group.download.done_down_side();
        group
    }
}

impl Tunnel for HalfDuplexClient {
    fn name(&self) -> &'static str {
        "halfduplex-client"
    }

    fn up_stream(&self, hop: &Hop<'_>, ctx: Context) {
        let Context { line, message, .. } = ctx;
        match message {
            Message::Init => self.open(hop, line),
            Message::Payload(buffer) => self.send(hop, line, buffer),
            Message::Est => trace!(line = line.id(), "est from below ignored"),
            Message::Fin => self.close_from_main(hop, &line),
        }
    }

    fn down_stream(&self, hop: &Hop<'_>, ctx: Context) {
        let Some(link) = Self::link(hop, &ctx.line) else {
            trace!(line = ctx.line.id(), kind = ctx.kind(), "context for a closed half dropped");
            return;
        };
        if link.role == Role::Main {
            warn!(line = ctx.line.id(), kind = ctx.kind(), "context from above on a main line ignored");
            return;
        }
        match &ctx.message {
            Message::Payload(_) => {
                let main = self.groups.with(link.group, |group| group.main.clone());
                hop.next_down(ctx.switch_line(main));
            }
            Message::Est if link.role == Role::Download => {
                let main = self.groups.with(link.group, |group| group.main.clone());
                hop.next_down(Context::est(main));
            }
            Message::Est => trace!(line = ctx.line.id(), "est on the upload half consumed"),
            Message::Init => warn!(line = ctx.line.id(), "init from above on a half ignored"),
            Message::Fin => self.close_from_half(hop, link, &ctx.line),
        }
    }
}

/// main line 上侧的流控：同时暂停两半的上侧。
struct MainFlow {
    upload: Line,
    download: Line,
}

impl FlowControl for MainFlow {
    fn pause(&self) {
        self.upload.pause_up_side();
        self.download.pause_up_side();
    }

    fn resume(&self) {
        self.upload.resume_up_side();
        self.download.resume_up_side();
    }
}

/// 两半下侧的流控：暂停 main line 的下侧。
struct HalfFlow {
    main: Line,
}

impl FlowControl for HalfFlow {
    fn pause(&self) {
        self.main.pause_down_side();
    }

    fn resume(&self) {
        self.main.resume_down_side();
    }
}
