//! `spark-halfduplex`：半双工隧道 stage。
//!
//! # 模块定位（Why）
//! - 某些传输只适合单向长连接，或希望请求与响应走不同路径；
//!   半双工协议把一条双向逻辑连接拆成上传、下载两条物理连接，由关联 id 在服务端重新配对；
//! - [`HalfDuplexClient`] 负责拆分与握手，[`HalfDuplexServer`] 负责配对、跨线程移交与整组拆除。
//!
//! # 模块索引
//! - [`header`]：8 字节关联头；
//! - [`table`]：跨线程共享的配对表；
//! - [`group`]：配对后三连接组的归属表；
//! - [`client`] / [`server`]：两端的 stage；
//! - [`config`] / [`error`]：配置与错误。

pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod header;
pub mod server;
pub mod table;

pub use client::HalfDuplexClient;
pub use config::{DEFAULT_MAX_BUFFERING, HalfDuplexServerConfig};
pub use error::HalfDuplexError;
pub use group::{GroupArena, GroupKey};
pub use header::{CorrelationHeader, Direction, HASH_MASK, HEADER_LEN, random_hash};
pub use server::{HalfDuplexServer, PairingCommand};
pub use table::{Arrival, PairingTables, Recheck};
