//! chainhead-evm: EVM JSON-RPC block source and head poller.
//!
//! ```text
//! node ──eth_blockNumber──► BlockPoller ──push──► FeedHandle ──► ChainTracker
//!  ▲                                                                  │
//!  └──eth_getBlockByNumber / eth_getLogs──── EvmBlockSource ◄─────────┘
//! ```

pub mod fetcher;
pub mod poller;

pub use fetcher::{block_from_json, parse_hex_u64, EvmBlockSource, EvmRpcClient, LogQuery, RawLog};
pub use poller::{BlockPoller, PollConfig};
