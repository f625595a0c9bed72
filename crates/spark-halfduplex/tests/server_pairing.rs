//! 半双工服务端集成测试：配对、缓存、跨线程移交与整组拆除。
//!
//! # 测试布局（How）
//! - 链为 `[transport, HalfDuplexServer, upstream]`，两端都是 `RecordingTunnel`；
//! - `ManualScheduler` 显式执行跨线程任务，每一步的表状态都可断言；
//! - 测试代替传输层关闭连接时，先上送 `Fin` 再销毁 Line，
//!   `Line::destroy` 的调试断言顺带验证了状态与流控是否已清理干净。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use proptest::prelude::*;
use spark_halfduplex::{CorrelationHeader, Direction, HalfDuplexServer, HalfDuplexServerConfig};
use spark_tunnel::{
    Chain, Context, FlowControl, Line, Runtime, RuntimeConfig, enter_worker,
    test_stubs::{ManualScheduler, Recorded, RecordingTunnel},
};

const SERVER: usize = 1;
const TOP: usize = 2;

struct Harness {
    scheduler: Arc<ManualScheduler>,
    chain: Arc<Chain>,
    server: Arc<HalfDuplexServer>,
    transport: Arc<RecordingTunnel>,
    upstream: Arc<RecordingTunnel>,
}

impl Harness {
    fn new(workers: usize) -> Self {
        Self::with_config(workers, HalfDuplexServerConfig::default())
    }

    fn with_config(workers: usize, config: HalfDuplexServerConfig) -> Self {
        let scheduler = ManualScheduler::new(workers);
        let runtime =
            Runtime::new(scheduler.clone(), RuntimeConfig::with_workers(workers)).expect("构建运行时失败");
        let server = HalfDuplexServer::new(&runtime, config).expect("构建服务端失败");
        let transport = RecordingTunnel::transport();
        let upstream = RecordingTunnel::upstream();
        let chain = Chain::builder(runtime)
            .stage(transport.clone())
            .stage(server.clone())
            .stage(upstream.clone())
            .build();
        Self {
            scheduler,
            chain,
            server,
            transport,
            upstream,
        }
    }

    /// 传输层在 `worker` 上接受一条新连接。
    fn accept(&self, worker: usize) -> Line {
        let line = Line::new(worker);
        let _worker = enter_worker(worker);
        self.chain.up_stream(0, Context::init(line.clone()));
        line
    }

    fn send(&self, line: &Line, bytes: &[u8]) {
        let _worker = enter_worker(line.worker());
        let payload = self.chain.runtime().pool(line.worker()).copy_from_slice(bytes);
        self.chain.up_stream(0, Context::payload(line.clone(), payload));
    }

    /// 接受连接并一次性发送关联头与 `trailing`。
    fn open(&self, worker: usize, direction: Direction, hash: u64, trailing: &[u8]) -> Line {
        let line = self.accept(worker);
        self.send(&line, &framed(direction, hash, trailing));
        line
    }

    /// 传输层关闭连接：上送 `Fin` 后销毁 Line。
    fn close(&self, line: &Line) {
        {
            let _worker = enter_worker(line.worker());
            self.chain.up_stream(0, Context::fin(line.clone()));
        }
        line.destroy();
    }

    /// 上游在 main line 上下行发送。
    fn send_down_main(&self, ctx: Context) {
        let _worker = enter_worker(ctx.line.worker());
        self.chain.down_stream(TOP, ctx);
    }

    fn reply(&self, main: &Line, bytes: &[u8]) {
        let payload = self.chain.runtime().pool(main.worker()).copy_from_slice(bytes);
        self.send_down_main(Context::payload(main.clone(), payload));
    }

    fn main(&self) -> Line {
        let mut mains = self.upstream.initiated_lines();
        assert_eq!(mains.len(), 1, "应当恰好合成一条 main line");
        mains.pop().expect("main line 缺失")
    }

    fn payload_firsts(&self, line: &Line) -> Vec<bool> {
        self.upstream
            .events()
            .into_iter()
            .filter(|event| event.line == *line && matches!(event.message, Recorded::Payload(_)))
            .map(|event| event.first)
            .collect()
    }

    fn active_leases(&self) -> usize {
        self.chain
            .runtime()
            .pools()
            .iter()
            .map(|pool| pool.statistics().active_leases)
            .sum()
    }

    fn assert_drained(&self) {
        assert_eq!(self.server.active_groups(), 0, "组应当全部拆除");
        assert_eq!(self.server.tables().pending_uploads(), 0);
        assert_eq!(self.server.tables().pending_downloads(), 0);
        assert_eq!(self.active_leases(), 0, "缓冲应当全部回池");
    }
}

fn framed(direction: Direction, hash: u64, trailing: &[u8]) -> Vec<u8> {
    let mut bytes = CorrelationHeader::new(direction, hash).encode().to_vec();
    bytes.extend_from_slice(trailing);
    bytes
}

/// 建立一组同线程配对，返回 (上传, 下载, main)。
fn paired(harness: &Harness, hash: u64) -> (Line, Line, Line) {
    let upload = harness.open(0, Direction::Upload, hash, b"");
    let download = harness.open(0, Direction::Download, hash, b"");
    (upload, download, harness.main())
}

#[derive(Default)]
struct CountingFlow {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl FlowControl for CountingFlow {
    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// 上传先到、下载后到：Unknown → UploadPending → Direct，上游只收到一次 Init。
#[test]
fn upload_then_download_pairs_on_same_worker() {
    let harness = Harness::new(1);
    let hash = 0x1234_5678;

    let upload = harness.open(0, Direction::Upload, hash, b"hello");
    assert!(harness.server.tables().contains_upload(hash));
    assert!(harness.upstream.initiated_lines().is_empty());
    assert_eq!(harness.transport.count(&upload, &Recorded::Est), 1);

    let download = harness.open(0, Direction::Download, hash, b"");
    assert!(!harness.server.tables().contains_upload(hash));
    assert!(!harness.server.tables().contains_download(hash));

    let main = harness.main();
    assert_eq!(main.worker(), 0);
    assert_eq!(
        harness.upstream.events_for(&main),
        vec![Recorded::Init, Recorded::Payload(b"hello".to_vec())]
    );
    assert_eq!(harness.payload_firsts(&main), vec![true]);
    assert_eq!(harness.transport.count(&download, &Recorded::Est), 1);
    assert_eq!(harness.server.active_groups(), 1);
}

#[test]
fn download_then_upload_pairs_on_same_worker() {
    let harness = Harness::new(1);

    harness.open(0, Direction::Download, 0x42, b"ignored");
    assert!(harness.server.tables().contains_download(0x42));

    harness.open(0, Direction::Upload, 0x42, b"abc");
    let main = harness.main();
    assert_eq!(harness.upstream.payload_bytes(&main), b"abc");
    assert_eq!(harness.payload_firsts(&main), vec![true]);
    assert_eq!(harness.active_leases(), 0, "下载头部之后的字节应被丢弃");
}

/// 关联头被拆成两段到达时先缓存，凑满 8 字节后再判定方向。
#[test]
fn header_split_across_payloads_is_reassembled() {
    let harness = Harness::new(1);
    let bytes = framed(Direction::Upload, 0x99, b"xy");

    let upload = harness.accept(0);
    harness.send(&upload, &bytes[..3]);
    assert_eq!(harness.server.tables().pending_uploads(), 0);
    harness.send(&upload, &bytes[3..]);
    assert!(harness.server.tables().contains_upload(0x99));

    harness.open(0, Direction::Download, 0x99, b"");
    assert_eq!(harness.upstream.payload_bytes(&harness.main()), b"xy");
}

/// 配对前的多段缓存合并为一条带 first 标记的负载，之后的负载不再带标记。
#[test]
fn buffered_bytes_are_delivered_once_in_order() {
    let harness = Harness::new(1);
    let upload = harness.open(0, Direction::Upload, 7, b"a");
    harness.send(&upload, b"b");
    harness.send(&upload, b"c");

    harness.open(0, Direction::Download, 7, b"");
    let main = harness.main();
    harness.send(&upload, b"d");

    assert_eq!(
        harness.upstream.events_for(&main),
        vec![
            Recorded::Init,
            Recorded::Payload(b"abc".to_vec()),
            Recorded::Payload(b"d".to_vec())
        ]
    );
    assert_eq!(harness.payload_firsts(&main), vec![true, false]);
}

/// 没有缓存时，上传上的第一条负载携带 first 标记。
#[test]
fn first_marker_without_buffered_bytes() {
    let harness = Harness::new(1);
    let (upload, _download, main) = paired(&harness, 8);

    harness.send(&upload, b"one");
    harness.send(&upload, b"two");
    assert_eq!(harness.payload_firsts(&main), vec![true, false]);
}

/// main line 上的下行负载送往下载连接，下载连接上的上行负载被丢弃。
#[test]
fn replies_flow_to_the_download_connection() {
    let harness = Harness::new(1);
    let (upload, download, main) = paired(&harness, 11);

    harness.reply(&main, b"resp");
    harness.send(&download, b"noise");
    harness.send_down_main(Context::est(main.clone()));

    assert_eq!(harness.transport.payload_bytes(&download), b"resp");
    assert!(harness.transport.payload_bytes(&upload).is_empty());
    assert!(harness.upstream.payload_bytes(&main).is_empty());
    assert_eq!(harness.transport.count(&download, &Recorded::Est), 1, "main 上的 Est 被消费");
    assert_eq!(harness.active_leases(), 0);
}

#[test]
fn buffering_at_the_cap_is_kept() {
    let harness = Harness::new(1);
    let body = vec![0xAB; 131_070];
    harness.open(0, Direction::Upload, 3, &body);
    harness.open(0, Direction::Download, 3, b"");

    assert_eq!(harness.upstream.payload_bytes(&harness.main()).len(), 131_070);
}

#[test]
fn buffering_past_the_cap_resets_without_closing() {
    let harness = Harness::new(1);
    let upload = harness.open(0, Direction::Upload, 4, &vec![0xCD; 131_070]);
    harness.send(&upload, b"!");

    assert!(upload.is_alive());
    assert_eq!(harness.transport.fin_count(&upload), 0);
    assert!(harness.server.tables().contains_upload(4));
    assert_eq!(harness.active_leases(), 0, "超限的缓存应当回池");

    harness.send(&upload, b"after");
    harness.open(0, Direction::Download, 4, b"");
    assert_eq!(harness.upstream.payload_bytes(&harness.main()), b"after");
}

/// 重复 id 的新连接被关闭，先到的连接不受影响并能继续配对。
#[test]
fn duplicate_id_closes_only_the_newcomer() {
    let harness = Harness::new(1);
    let first = harness.open(0, Direction::Upload, 5, b"1");
    let second = harness.open(0, Direction::Upload, 5, b"2");

    assert!(!second.is_alive());
    assert_eq!(harness.transport.fin_count(&second), 1);
    assert!(first.is_alive());
    assert!(harness.server.tables().contains_upload(5));

    harness.open(0, Direction::Download, 5, b"");
    assert_eq!(harness.upstream.payload_bytes(&harness.main()), b"1");
}

/// 上传与下载分别在两个线程等待时，再到的重复上传无论落在哪个线程都被关闭，
/// 原上传经复查照常配对。
#[test]
fn duplicate_upload_leaves_the_waiting_pair_intact() {
    let harness = Harness::new(2);
    let hash = 0x2_0000;
    let first = harness.open(0, Direction::Upload, hash, b"first");
    let download = harness.open(1, Direction::Download, hash, b"");

    let newcomers = [
        harness.open(1, Direction::Upload, hash, b"steal"),
        harness.open(0, Direction::Upload, hash, b"steal"),
    ];
    for newcomer in &newcomers {
        assert_eq!(harness.transport.fin_count(newcomer), 1);
        assert!(!newcomer.is_alive());
        assert!(!newcomer.is_up_piped(), "重复连接不得被移交");
    }
    assert!(harness.upstream.initiated_lines().is_empty());
    assert!(first.is_alive());
    assert!(harness.server.tables().contains_upload(hash));
    assert!(harness.server.tables().contains_download(hash));

    harness.scheduler.run_pending();
    let main = harness.main();
    assert_eq!(harness.upstream.payload_bytes(&main), b"first");
    assert_eq!(harness.transport.fin_count(&first), 0);

    harness.reply(&main, b"resp");
    assert_eq!(harness.transport.payload_bytes(&download), b"resp");
}

/// 对称情形：重复下载被关闭，等待中的下载仍是配对对象并收到回包。
#[test]
fn duplicate_download_leaves_the_waiting_pair_intact() {
    let harness = Harness::new(2);
    let hash = 0x2_0001;
    let upload = harness.open(0, Direction::Upload, hash, b"data");
    let first = harness.open(1, Direction::Download, hash, b"");
    assert_eq!(harness.scheduler.pending(0), 1);

    let newcomers = [
        harness.open(0, Direction::Download, hash, b""),
        harness.open(1, Direction::Download, hash, b""),
    ];
    for newcomer in &newcomers {
        assert_eq!(harness.transport.fin_count(newcomer), 1);
        assert!(!newcomer.is_alive());
    }
    assert_eq!(harness.scheduler.pending(0), 1, "重复下载不再投递复查");
    assert!(harness.upstream.initiated_lines().is_empty());
    assert!(harness.server.tables().contains_upload(hash));

    harness.scheduler.run_pending();
    let main = harness.main();
    assert_eq!(main.worker(), first.worker());
    assert_eq!(harness.upstream.payload_bytes(&main), b"data");
    assert!(upload.is_up_piped());

    harness.reply(&main, b"resp");
    assert_eq!(harness.transport.payload_bytes(&first), b"resp");
    assert_eq!(harness.server.tables().pending_downloads(), 0);
}

#[test]
fn closing_pending_connections_clears_the_tables() {
    let harness = Harness::new(1);
    let upload = harness.open(0, Direction::Upload, 21, b"pending");
    let download = harness.open(0, Direction::Download, 22, b"");
    let unknown = harness.accept(0);
    harness.send(&unknown, &[0x80]);

    harness.close(&upload);
    harness.close(&download);
    harness.close(&unknown);

    assert!(harness.upstream.initiated_lines().is_empty());
    harness.assert_drained();
}

/// 上传关闭：main 与下载各收到一次 Fin。
#[test]
fn upload_close_finishes_main_and_download_once() {
    let harness = Harness::new(1);
    let (upload, download, main) = paired(&harness, 31);

    harness.close(&upload);

    assert_eq!(harness.upstream.fin_count(&main), 1);
    assert_eq!(harness.transport.fin_count(&download), 1);
    assert_eq!(harness.transport.fin_count(&upload), 0);
    assert!(!main.is_alive());
    assert!(!download.is_alive());
    harness.assert_drained();
}

#[test]
fn download_close_finishes_main_and_upload_once() {
    let harness = Harness::new(1);
    let (upload, download, main) = paired(&harness, 32);

    harness.close(&download);

    assert_eq!(harness.upstream.fin_count(&main), 1);
    assert_eq!(harness.transport.fin_count(&upload), 1);
    assert_eq!(harness.transport.fin_count(&download), 0);
    assert!(!main.is_alive());
    assert!(!upload.is_alive());
    harness.assert_drained();
}

/// 上游关闭 main line：两条物理连接各收到一次 Fin。
#[test]
fn main_close_finishes_both_halves_once() {
    let harness = Harness::new(1);
    let (upload, download, main) = paired(&harness, 33);

    harness.send_down_main(Context::fin(main.clone()));

    assert_eq!(harness.transport.fin_count(&upload), 1);
    assert_eq!(harness.transport.fin_count(&download), 1);
    assert_eq!(harness.upstream.fin_count(&main), 0);
    assert!(!main.is_alive());
    assert!(!upload.is_alive());
    assert!(!download.is_alive());
    harness.assert_drained();
}

/// 上游拒绝 main line：两半被关闭，缓存的负载不会上送。
#[test]
fn upstream_rejection_unwinds_the_pair() {
    let harness = Harness::new(1);
    harness.upstream.reject_init(true);

    let upload = harness.open(0, Direction::Upload, 34, b"lost");
    let download = harness.open(0, Direction::Download, 34, b"");
    let main = harness.main();

    assert!(!main.is_alive());
    assert!(harness.upstream.payload_bytes(&main).is_empty());
    assert_eq!(harness.transport.fin_count(&upload), 1);
    assert_eq!(harness.transport.fin_count(&download), 1);
    harness.assert_drained();
}

/// 上传在 0 号线程等待、下载落在 1 号线程：通知 0 号线程复查，上传经管道移交后完成配对。
#[test]
fn download_on_other_worker_triggers_recheck_and_hand_off() {
    let harness = Harness::new(2);
    let hash = 0x1_0000;

    let upload = harness.open(0, Direction::Upload, hash, b"early");
    let download = harness.open(1, Direction::Download, hash, b"");
    assert_eq!(harness.scheduler.pending(0), 1, "应当向上传所在线程投递复查");
    assert!(harness.upstream.initiated_lines().is_empty());

    harness.scheduler.run_pending();
    assert!(upload.is_up_piped());
    let main = harness.main();
    assert_eq!(main.worker(), 1);
    assert_eq!(harness.upstream.payload_bytes(&main), b"early");
    assert_eq!(harness.payload_firsts(&main), vec![true]);

    harness.send(&upload, b"late");
    harness.scheduler.run_pending();
    assert_eq!(harness.upstream.payload_bytes(&main), b"earlylate");

    harness.reply(&main, b"resp");
    assert_eq!(harness.transport.payload_bytes(&download), b"resp");
    assert_eq!(harness.transport.count(&upload, &Recorded::Est), 1, "管道目标端不重复回应 Est");

    harness.close(&upload);
    harness.scheduler.run_pending();
    assert_eq!(harness.upstream.fin_count(&main), 1);
    assert_eq!(harness.transport.fin_count(&download), 1);
    assert!(!main.is_alive());
    harness.assert_drained();
}

/// 下载在 1 号线程等待、上传后到 0 号线程：上传直接移交，无需复查。
#[test]
fn upload_on_other_worker_is_handed_off_directly() {
    let harness = Harness::new(2);

    let download = harness.open(1, Direction::Download, 0x77, b"");
    let upload = harness.open(0, Direction::Upload, 0x77, b"x");
    assert!(upload.is_up_piped());
    assert!(harness.server.tables().contains_download(0x77));

    harness.scheduler.run_pending();
    let main = harness.main();
    assert_eq!(main.worker(), 1);
    assert_eq!(harness.upstream.payload_bytes(&main), b"x");

    harness.send_down_main(Context::fin(main.clone()));
    harness.scheduler.run_pending();
    assert_eq!(harness.transport.fin_count(&upload), 1, "Fin 经管道回到上传连接");
    assert_eq!(harness.transport.fin_count(&download), 1);
    assert!(!upload.is_alive());
    assert!(!download.is_alive());
    harness.assert_drained();
}

/// 复查到达前下载已关闭：上传无法再配对，被关闭。
#[test]
fn recheck_closes_an_orphaned_upload() {
    let harness = Harness::new(2);
    let upload = harness.open(0, Direction::Upload, 0x55, b"buffered");
    let download = harness.open(1, Direction::Download, 0x55, b"");
    harness.close(&download);

    harness.scheduler.run_pending();
    assert_eq!(harness.transport.fin_count(&upload), 1);
    assert!(!upload.is_alive());
    assert!(harness.upstream.initiated_lines().is_empty());
    harness.assert_drained();
}

/// 复查到达前上传已关闭：复查不做任何事，下载继续等待。
#[test]
fn stale_recheck_is_a_no_op() {
    let harness = Harness::new(2);
    let upload = harness.open(0, Direction::Upload, 0x56, b"");
    let download = harness.open(1, Direction::Download, 0x56, b"");
    harness.close(&upload);

    harness.scheduler.run_pending();
    assert!(download.is_alive());
    assert!(download.has_state(SERVER), "下载仍处于等待状态");
    assert_eq!(harness.transport.fin_count(&download), 0);
    assert!(harness.server.tables().contains_download(0x56));

    harness.close(&download);
    harness.assert_drained();
}

/// 物理连接的暂停传到 main 的上侧，main 下侧的暂停传到两条物理连接。
#[test]
fn pause_propagates_between_main_and_halves() {
    let harness = Harness::new(1);
    let (upload, download, main) = paired(&harness, 61);
    let writer = Arc::new(CountingFlow::default());
    let upload_reader = Arc::new(CountingFlow::default());
    let download_reader = Arc::new(CountingFlow::default());
    main.setup_up_side(writer.clone());
    upload.setup_down_side(upload_reader.clone());
    download.setup_down_side(download_reader.clone());

    let _worker = enter_worker(0);
    download.pause_up_side();
    upload.pause_up_side();
    assert_eq!(writer.pauses.load(Ordering::SeqCst), 1);
    assert!(main.is_up_side_paused());

    main.pause_down_side();
    assert_eq!(upload_reader.pauses.load(Ordering::SeqCst), 1);
    assert_eq!(download_reader.pauses.load(Ordering::SeqCst), 1);
    main.resume_down_side();
    assert_eq!(upload_reader.resumes.load(Ordering::SeqCst), 1);
    assert_eq!(download_reader.resumes.load(Ordering::SeqCst), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// 任意分段写入下，配对时上送的缓存等于“超限即清空”模型的结果。
    #[test]
    fn pending_buffer_follows_the_reset_model(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..12), 0..8)
    ) {
        const LIMIT: usize = 16;
        let config = HalfDuplexServerConfig {
            max_buffering: LIMIT,
            ..HalfDuplexServerConfig::default()
        };
        let harness = Harness::with_config(1, config);
        let upload = harness.open(0, Direction::Upload, 0x88, b"");

        let mut model = Vec::new();
        for chunk in &chunks {
            harness.send(&upload, chunk);
            model.extend_from_slice(chunk);
            if model.len() > LIMIT {
                model.clear();
            }
        }
        harness.open(0, Direction::Download, 0x88, b"");

        let main = harness.main();
        prop_assert_eq!(harness.upstream.payload_bytes(&main), model);
        prop_assert_eq!(harness.active_leases(), 0);
    }
}
