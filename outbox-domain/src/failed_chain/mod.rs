//! 失败链（Failed-Message Chain）死信模型与仓储协议
//!
//! 分发失败的事件按实体归组为一条失败链，链内按失败顺序保存消息，
//! 供后续有界、有序地重发。删除链时级联删除其全部消息。

mod failed_message;
mod store;

pub use failed_message::{ChainClaim, FailedMessage, FailedMessageChain, FailureDetails};
pub use store::FailedMessageChainStore;
