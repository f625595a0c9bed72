//! 配对表：按关联 id 记录尚未配对的上传与下载连接。
//!
//! ## 核心意图（Why）
//! - 同一逻辑连接的两条物理连接可能落在任意工作线程上，配对表是唯一被多个线程修改的状态；
//! - 同一 id 的上传表与下载表位于同一个分片、受同一把锁保护，
//!   “查找对端，否则登记自己”因此是一个临界区，不存在两端同时登记却互相错过的窗口。
//!
//! ## 契约（What）
//! - 每个 id 在每个方向上至多一条等待中的连接；重复登记返回 [`Arrival::Duplicate`]，表不变；
//! - 临界区内只做查找与增删，从不调用链路；
//! - 按预期应当存在的条目缺失时直接 panic（见 [`PairingTables::remove_upload`]）。

use std::collections::{HashMap, hash_map::Entry};

use parking_lot::Mutex;
use spark_tunnel::{Line, WorkerId};

/// 一条连接到达后的配对结论。
#[derive(Debug)]
pub enum Arrival {
    /// 已登记，等待对端。
    Pending,
    /// 同方向已有等待中的连接，新连接属于协议违例。
    Duplicate,
    /// 对端在当前线程，已从表中取出。
    Paired(Line),
    /// 上传到达，但下载等待在其它线程：上传应移交过去，表不变。
    PeerElsewhere { worker: WorkerId },
    /// 下载到达并已登记，但上传等待在其它线程：需通知该线程重新检查。
    UploadElsewhere { worker: WorkerId },
}

/// 重新检查的结论。
#[derive(Debug)]
pub enum Recheck {
    /// 上传已不在表中或已不归本线程，无事可做。
    Stale,
    /// 上传已出表，应移交到下载所在线程。
    Handoff { upload: Line, download_worker: WorkerId },
    /// 上传已出表，但对应的下载已消失。
    Orphaned(Line),
}

#[derive(Default)]
struct Shard {
    uploads: HashMap<u64, Line>,
    downloads: HashMap<u64, Line>,
}

pub struct PairingTables {
    shards: Vec<Mutex<Shard>>,
}

impl PairingTables {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
        }
    }

    fn shard(&self, hash: u64) -> &Mutex<Shard> {
        // 分片数不超过 usize，取模结果可无损转换。
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// 上传连接读到关联头。
    ///
    /// 同方向的等待条目先于对端查找：重复的新连接不得抢走已登记连接的配对。
    pub fn arrive_upload(&self, hash: u64, line: &Line) -> Arrival {
        let mut guard = self.shard(hash).lock();
        let shard = &mut *guard;
        if shard.uploads.contains_key(&hash) {
            return Arrival::Duplicate;
        }
        match shard.downloads.entry(hash) {
            Entry::Occupied(download) if download.get().worker() == line.worker() => {
                Arrival::Paired(download.remove())
            }
            Entry::Occupied(download) => Arrival::PeerElsewhere {
                worker: download.get().worker(),
            },
            Entry::Vacant(_) => {
                shard.uploads.insert(hash, line.clone());
                Arrival::Pending
            }
        }
    }

    /// 下载连接读到关联头。
    pub fn arrive_download(&self, hash: u64, line: &Line) -> Arrival {
        let mut guard = self.shard(hash).lock();
        let shard = &mut *guard;
        let Entry::Vacant(slot) = shard.downloads.entry(hash) else {
            return Arrival::Duplicate;
        };
        match shard.uploads.entry(hash) {
            Entry::Occupied(upload) if upload.get().worker() == line.worker() => {
                Arrival::Paired(upload.remove())
            }
            Entry::Occupied(upload) => {
                let worker = upload.get().worker();
                slot.insert(line.clone());
                Arrival::UploadElsewhere { worker }
            }
            Entry::Vacant(_) => {
                slot.insert(line.clone());
                Arrival::Pending
            }
        }
    }

    /// 在 `worker` 上重新检查 `hash` 的上传是否可以移交给下载所在线程。
    ///
    /// # Panics
    /// 下载与上传同处 `worker` 时 panic：这种组合在登记时就应直接配对。
    pub fn recheck(&self, hash: u64, worker: WorkerId) -> Recheck {
        let mut shard = self.shard(hash).lock();
        let upload = match shard.uploads.entry(hash) {
            Entry::Occupied(upload) if upload.get().worker() == worker => upload.remove(),
            _ => return Recheck::Stale,
        };
        match shard.downloads.get(&hash) {
            Some(download) => {
                let download_worker = download.worker();
                assert_ne!(
                    download_worker, worker,
                    "upload and download {hash:#x} pending on the same worker"
                );
                Recheck::Handoff {
                    upload,
                    download_worker,
                }
            }
            None => Recheck::Orphaned(upload),
        }
    }

    /// 撤销等待中的上传登记。
    ///
    /// # Panics
    /// 条目缺失或已属于另一条连接时 panic。
    pub fn remove_upload(&self, hash: u64, line: &Line) {
        let mut shard = self.shard(hash).lock();
        match shard.uploads.remove(&hash) {
            Some(found) if found == *line => {}
            found => panic!(
                "pending upload {hash:#x} for line {} missing from table (found {found:?})",
                line.id()
            ),
        }
    }

    /// 撤销等待中的下载登记。
    ///
    /// # Panics
    /// 条目缺失或已属于另一条连接时 panic。
    pub fn remove_download(&self, hash: u64, line: &Line) {
        let mut shard = self.shard(hash).lock();
        match shard.downloads.remove(&hash) {
            Some(found) if found == *line => {}
            found => panic!(
                "pending download {hash:#x} for line {} missing from table (found {found:?})",
                line.id()
            ),
        }
    }

    pub fn contains_upload(&self, hash: u64) -> bool {
        self.shard(hash).lock().uploads.contains_key(&hash)
    }

    pub fn contains_download(&self, hash: u64) -> bool {
        self.shard(hash).lock().downloads.contains_key(&hash)
    }

    pub fn pending_uploads(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().uploads.len()).sum()
    }

    pub fn pending_downloads(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().downloads.len())
            .sum()
    }
}
